//! Rebase command - swap the run image under an app image

use crate::cli::args::RebaseArgs;
use crate::client::{Client, RebaseRequest};
use crate::error::PackResult;
use crate::ui::{TaskSpinner, UiContext};

/// Execute the rebase command
pub async fn execute(args: RebaseArgs, client: &Client, ctx: &UiContext) -> PackResult<()> {
    let req = RebaseRequest {
        image: args.image,
        run_image: args.run_image,
        publish: args.publish,
        pull: !args.no_pull,
        additional_tags: args.tags,
    };

    let mut spinner = TaskSpinner::new(ctx);
    spinner.start(&format!("Rebasing {}...", req.image));
    match client.rebase(&req).await {
        Ok(id) => {
            spinner.stop(&format!("Rebased {} ({})", req.image, short_id(&id)));
            Ok(())
        }
        Err(e) => {
            spinner.stop_error(&format!("Failed to rebase {}", req.image));
            Err(e)
        }
    }
}

/// First 12 hex digits of an image id or digest
pub(crate) fn short_id(id: &str) -> &str {
    let hex = id.split_once(':').map_or(id, |(_, hex)| hex);
    &hex[..hex.len().min(12)]
}
