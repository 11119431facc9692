use anyhow::{Context, Result};
use candle_core::Device;
use signlingo_ml::artifact::ModelArtifact;
use signlingo_ml::compat::{patch_artifact_in_place, patch_blob};
use signlingo_ml::model_loader::{CompatLoader, ManualReconstruction, NativeLoad};
use signlingo_ml::sequence_model::CompatScope;
use std::env;
use std::path::Path;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        println!("Usage: inspect_model <model.safetensors> [--patch]");
        return Ok(());
    }
    let path = Path::new(&args[1]);
    let apply = args.iter().skip(2).any(|a| a == "--patch");

    println!("Inspecting artifact: {}", path.display());
    let artifact = ModelArtifact::open(path)?;

    println!("\n--- Config ---");
    let blob = artifact.config_blob()?;
    match &blob {
        Some(blob) => match serde_json::from_str::<serde_json::Value>(blob) {
            Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            Err(e) => println!("(not valid JSON: {})\n{}", e, blob),
        },
        None => println!("(missing)"),
    }

    println!("\n--- Tensors ---");
    for (name, shape) in artifact.tensor_shapes()? {
        println!("{:<40} {:?}", name, shape);
    }

    if let Some(blob) = &blob {
        let pending = patch_blob(blob).map(|p| p.is_some()).unwrap_or(false);
        println!("\nCompatibility patch would change config: {}", pending);
    }

    if apply {
        let changed = patch_artifact_in_place(path).context("patch failed")?;
        println!("Patched: {}", changed);
    }

    // without --patch the artifact stays untouched
    let loader = if apply {
        CompatLoader::standard(Device::Cpu)
    } else {
        CompatLoader::new(
            vec![
                Box::new(NativeLoad {
                    scope: CompatScope::standard(),
                }),
                Box::new(ManualReconstruction),
            ],
            Device::Cpu,
        )
    };

    println!("\n--- Load ({}) ---", loader.strategy_names().join(" -> "));
    match loader.load(path) {
        Ok(model) => {
            let arch = model.architecture();
            println!("Input: {:?}", arch.input);
            for layer in &arch.layers {
                println!("  {:?}", layer);
            }
            println!("Output classes: {}", arch.output_dim());
        }
        Err(e) => println!("Failed: {}", e),
    }

    Ok(())
}
