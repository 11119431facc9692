use anyhow::{Context, Result};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use signlingo_ml::config::LandmarkSettings;
use signlingo_ml::landmarks::{output_role, HandLandmarker, OnnxHandLandmarker};
use signlingo_ml::types::NUM_LANDMARKS;
use std::env;
use std::path::Path;

/// Shows how the landmarker will bind this model: the image input it feeds
/// and which output it reads as coordinates or presence.
fn describe_bindings(session: &Session, input_size: u32) {
    println!("\n--- Bindings ---");
    match session.inputs.first() {
        Some(input) => println!(
            "image   <- {} {:?} (fed as [1, {}, {}, 3])",
            input.name, input.input_type, input_size, input_size
        ),
        None => println!("image   <- (model has no inputs)"),
    }
    for (i, output) in session.outputs.iter().enumerate() {
        println!("{:<9} -> {} {:?}", output_role(i), output.name, output.output_type);
    }
    if session.outputs.len() < 2 {
        println!("presence output missing: the service will refuse this model");
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        println!("Usage: inspect_onnx <hand_landmark.onnx> [image]");
        return Ok(());
    }

    let model_path = Path::new(&args[1]);
    let settings = LandmarkSettings::default();
    println!("Inspecting hand landmark model: {}", model_path.display());

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level1)?
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load {}", model_path.display()))?;
    describe_bindings(&session, settings.input_size);

    if let Some(image_path) = args.get(2) {
        let frame = image::open(image_path)
            .with_context(|| format!("failed to open {}", image_path))?
            .to_rgb8();
        let landmarker = OnnxHandLandmarker::new(model_path, &settings)?;

        println!("\n--- {} on {} ---", landmarker.name(), image_path);
        match landmarker.detect(&frame)? {
            Some(hand) => {
                for (i, p) in hand.points().iter().enumerate() {
                    println!("{:>2}: x={:.4} y={:.4} z={:.4}", i, p.x, p.y, p.z);
                }
                println!("{} landmarks", NUM_LANDMARKS);
            }
            None => println!("No hand above presence {:.2}", settings.min_detection_confidence),
        }
    }

    Ok(())
}
