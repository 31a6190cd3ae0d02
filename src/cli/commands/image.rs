//! Inspect-image command - describe an app image

use crate::cli::args::InspectImageArgs;
use crate::client::{Client, ImageInfo};
use crate::error::PackResult;
use crate::ui::{self, UiContext};
use serde_json::json;

/// Execute the inspect-image command
pub async fn inspect(args: InspectImageArgs, client: &Client, ctx: &UiContext) -> PackResult<()> {
    let remote = client.inspect_image(&args.image, false).await;
    let local = client.inspect_image(&args.image, true).await;

    if args.bom {
        let bom = |result: &PackResult<Option<ImageInfo>>| match result {
            Ok(Some(info)) => info.bom.clone(),
            _ => serde_json::Value::Null,
        };
        let doc = json!({ "remote": bom(&remote), "local": bom(&local) });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("Inspecting image: {}", args.image);
    for (title, result) in [("REMOTE", remote), ("LOCAL", local)] {
        ui::section(ctx, &format!("{}:", title));
        match result {
            Ok(Some(info)) => print!("{}", render_image(&info)),
            Ok(None) => println!("(not present)"),
            Err(e) => println!("ERROR: {}", e),
        }
    }
    Ok(())
}

/// Human-readable description of an app image
pub(crate) fn render_image(info: &ImageInfo) -> String {
    let mut out = vec![
        format!("\nStack: {}", info.stack_id),
        "\nBase Image:".to_string(),
    ];
    if !info.base.reference.is_empty() {
        out.push(format!("  Reference: {}", info.base.reference));
    }
    out.push(format!("  Top Layer: {}", info.base.top_layer));

    out.push("\nRun Images:".to_string());
    let mut run_images: Vec<String> = info
        .local_mirrors
        .iter()
        .map(|m| format!("  {} (user-configured)", m))
        .collect();
    if !info.run_image.image.is_empty() {
        run_images.push(format!("  {}", info.run_image.image));
    }
    run_images.extend(info.run_image.mirrors.iter().map(|m| format!("  {}", m)));
    if run_images.is_empty() {
        run_images.push("  (none)".to_string());
    }
    out.extend(run_images);

    out.push("\nBuildpacks:".to_string());
    if info.buildpacks.is_empty() {
        out.push("  (none)".to_string());
    } else {
        let width = info.buildpacks.iter().map(|b| b.id.len()).max().unwrap_or(0).max(2);
        out.push(format!("  {:<width$}  VERSION", "ID"));
        for bp in &info.buildpacks {
            out.push(format!("  {:<width$}  {}", bp.id, bp.version));
        }
    }
    let mut text = out.join("\n");
    text.push('\n');
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dist::{BuildpackRef, RunImageMetadata, StackRunImage};

    #[test]
    fn renders_image() {
        let info = ImageInfo {
            stack_id: "stacks.bionic".to_string(),
            base: RunImageMetadata {
                top_layer: "sha256:top".to_string(),
                reference: "sha256:ref".to_string(),
            },
            run_image: StackRunImage {
                image: "cnb/run".to_string(),
                mirrors: Vec::new(),
            },
            local_mirrors: Vec::new(),
            buildpacks: vec![BuildpackRef {
                id: "bp.one".to_string(),
                version: "1.0.0".to_string(),
            }],
            bom: serde_json::Value::Null,
        };
        let text = render_image(&info);
        assert!(text.contains("Stack: stacks.bionic"));
        assert!(text.contains("  Reference: sha256:ref\n  Top Layer: sha256:top"));
        assert!(text.contains("Run Images:\n  cnb/run\n"));
        assert!(text.contains("  bp.one  1.0.0"));
    }
}
