use super::{human_size, json_pretty, or_dash, CommandResult, EXIT_SUCCESS};
use envd_core::EnvironmentEngine;

pub fn run(engine: &dyn EnvironmentEngine, json: bool) -> CommandResult {
    let images = engine.list_images()?;
    if json {
        println!("{}", json_pretty(&images)?);
    } else if images.is_empty() {
        println!("no images found");
    } else {
        println!(
            "{:<32} {:<14} {:<5} {:<8} {:<18} SIZE",
            "REFERENCE", "IMAGE_ID", "GPU", "CUDA", "CREATED"
        );
        for img in &images {
            let created = img
                .created
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string());
            println!(
                "{:<32} {:<14} {:<5} {:<8} {:<18} {}",
                img.reference,
                img.id.short(),
                img.manifest.gpu,
                or_dash(img.manifest.cuda.as_deref()),
                or_dash(created.as_deref()),
                human_size(img.size),
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
