//! Build command - run the lifecycle against an app directory

use crate::build::CancelToken;
use crate::cli::args::BuildArgs;
use crate::client::{BuildRequest, Client};
use crate::error::PackResult;
use crate::ui::{self, UiContext};
use tracing::debug;

/// Execute the build command
pub async fn execute(args: BuildArgs, client: &Client, ctx: &UiContext, verbose: bool) -> PackResult<()> {
    let req = BuildRequest {
        image: args.image,
        app_dir: args.path.unwrap_or_else(|| ".".into()),
        builder: args.builder,
        run_image: args.run_image,
        env_files: args.env_files,
        env: args.env,
        buildpacks: args.buildpacks,
        publish: args.publish,
        pull: !args.no_pull,
        clear_cache: args.clear_cache,
        verbose,
    };

    let cancel = CancelToken::new();
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("Interrupt received, canceling build");
                cancel.cancel();
            }
        }
    });

    let result = client.build(&req, cancel).await;
    watcher.abort();
    result?;

    ui::step_ok(ctx, &format!("Successfully built image {}", req.image));
    Ok(())
}
