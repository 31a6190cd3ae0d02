//! Builder commands - create, inspect and pick a default builder

use super::suggest::SUGGESTED_BUILDERS;
use crate::builder::CreateOptions;
use crate::cli::args::{CreateBuilderArgs, InspectBuilderArgs, SetDefaultBuilderArgs};
use crate::client::{BuilderInfo, Client};
use crate::config::ConfigManager;
use crate::error::{PackError, PackResult};
use crate::ui::{self, TaskSpinner, UiContext};

/// Execute the create-builder command
pub async fn create(args: CreateBuilderArgs, client: &Client, ctx: &UiContext) -> PackResult<()> {
    let opts = CreateOptions {
        publish: args.publish,
        pull: !args.no_pull,
    };
    let mut spinner = TaskSpinner::new(ctx);
    spinner.start(&format!("Creating builder {}...", args.image));
    match client.create_builder(&args.image, &args.builder_config, opts).await {
        Ok((_, warnings)) => {
            spinner.stop(&format!("Successfully created builder image {}", args.image));
            for warning in &warnings {
                ui::step_warn(ctx, warning);
            }
            ui::remark(
                ctx,
                &format!("Tip: Run pack build <image-name> --builder {} to use this builder", args.image),
            );
            Ok(())
        }
        Err(e) => {
            spinner.stop_error(&format!("Failed to create builder {}", args.image));
            Err(e)
        }
    }
}

/// Execute the inspect-builder command
pub async fn inspect(args: InspectBuilderArgs, client: &Client, ctx: &UiContext) -> PackResult<()> {
    let name = args
        .image
        .or_else(|| client.config().default_builder_image.clone())
        .ok_or(PackError::NoDefaultBuilder)?;

    println!("Inspecting builder: {}", name);
    for (title, daemon) in [("Remote", false), ("Local", true)] {
        ui::section(ctx, &format!("{} Information:", title));
        match client.inspect_builder(&name, daemon).await {
            Ok(Some(info)) => print!("{}", render_builder(&info)),
            Ok(None) => println!("(not present)"),
            Err(e) => println!("ERROR: inspecting {} image '{}': {}", title.to_lowercase(), name, e),
        }
    }
    Ok(())
}

/// Human-readable description of a builder
pub(crate) fn render_builder(info: &BuilderInfo) -> String {
    let mut out = Vec::new();
    if !info.description.is_empty() {
        out.push(format!("\nDescription: {}", info.description));
    }
    out.push(format!("\nStack: {}", info.stack_id));
    out.push(format!("\nLifecycle Version: {}", info.lifecycle_version));

    out.push("\nRun Images:".to_string());
    let run_images: Vec<String> = info
        .local_mirrors
        .iter()
        .map(|m| format!("  {} (user-configured)", m))
        .chain(
            std::iter::once(&info.run_image.image)
                .filter(|i| !i.is_empty())
                .map(|i| format!("  {}", i)),
        )
        .chain(info.run_image.mirrors.iter().map(|m| format!("  {}", m)))
        .collect();
    if run_images.is_empty() {
        out.push("  (none)".to_string());
    }
    out.extend(run_images);

    out.push("\nBuildpacks:".to_string());
    if info.buildpacks.is_empty() {
        out.push("  (none)".to_string());
    } else {
        let width = info.buildpacks.iter().map(|b| b.id.len()).max().unwrap_or(0).max(2);
        out.push(format!("  {:<width$}  {:<12}  LATEST", "ID", "VERSION"));
        for bp in &info.buildpacks {
            out.push(format!("  {:<width$}  {:<12}  {}", bp.id, bp.version, bp.latest));
        }
    }

    out.push("\nDetection Order:".to_string());
    if info.order.is_empty() {
        out.push("  (none)".to_string());
    }
    for (i, group) in info.order.iter().enumerate() {
        out.push(format!("  Group #{}:", i + 1));
        for entry in &group.group {
            let optional = if entry.optional { "    (optional)" } else { "" };
            out.push(format!("    {}{}", entry.full_name(), optional));
        }
    }
    let mut text = out.join("\n");
    text.push('\n');
    text
}

/// Execute the set-default-builder command
pub async fn set_default(
    args: SetDefaultBuilderArgs,
    manager: &ConfigManager,
    ctx: &UiContext,
) -> PackResult<()> {
    let name = match args.name {
        Some(name) => name,
        None => {
            let options: Vec<(String, &str, &str)> = SUGGESTED_BUILDERS
                .iter()
                .map(|b| (b.image.to_string(), b.image, b.description))
                .collect();
            ui::select(ctx, "Select a default builder", &options)
                .await?
                .ok_or_else(|| {
                    PackError::User(
                        "builder name required, see `pack suggest-builders` for options".to_string(),
                    )
                })?
        }
    };

    manager.set_default_builder(&name).await?;
    ui::step_ok(ctx, &format!("Builder {} is now the default builder", name));
    Ok(())
}
