//! Rebase: swap the run image under an app image
//!
//! Layers above the recorded run image top layer are kept as they are; the
//! layers below are replaced by those of the new run image.

use crate::dist::{labels, LayersMetadata};
use crate::error::{PackError, PackResult};
use crate::image::{select_run_image, stack_id, Image, ImageFetcher};
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct RebaseOptions {
    pub image: String,
    /// Explicit run image; otherwise taken from the app image metadata
    pub run_image: Option<String>,
    /// User-configured mirrors, keyed by run image
    pub run_image_mirrors: BTreeMap<String, Vec<String>>,
    pub publish: bool,
    pub pull: bool,
    pub additional_tags: Vec<String>,
}

/// Move `image` onto `new_base`, updating its layer metadata.
///
/// Both images must carry the same non-empty stack id. Nothing is changed
/// when they don't.
pub async fn rebase_image(image: &mut dyn Image, new_base: &dyn Image) -> PackResult<()> {
    let label = image.label(labels::LAYERS_METADATA).unwrap_or_default();
    let mut metadata = LayersMetadata::from_label(&label)?;
    if metadata.run_image.top_layer.is_empty() {
        return Err(PackError::ConfigInvalid(format!(
            "image '{}' has no run image top layer in {}",
            image.name(),
            labels::LAYERS_METADATA
        )));
    }

    let app_stack = stack_id(image);
    let base_stack = stack_id(new_base);
    if app_stack.is_empty() || base_stack.is_empty() || app_stack != base_stack {
        return Err(PackError::stack_mismatch(app_stack, base_stack));
    }

    debug!(
        "Replacing base layers up to {} with those of {}",
        metadata.run_image.top_layer,
        new_base.name()
    );
    image.rebase(&metadata.run_image.top_layer, new_base).await?;

    metadata.run_image.top_layer = new_base.top_layer()?;
    metadata.run_image.reference = new_base.identifier()?;
    image.set_label(labels::LAYERS_METADATA, &metadata.to_label()?);
    Ok(())
}

/// Rebase a saved app image and save it under its name and any tags
pub async fn rebase(fetcher: &dyn ImageFetcher, opts: &RebaseOptions) -> PackResult<String> {
    let daemon = !opts.publish;
    let mut image = fetcher.fetch(&opts.image, daemon, opts.pull).await?;

    let run_image = match &opts.run_image {
        Some(run_image) => run_image.clone(),
        None => {
            let label = image.label(labels::LAYERS_METADATA).unwrap_or_default();
            let metadata = LayersMetadata::from_label(&label)?;
            if metadata.stack.run_image.image.is_empty() {
                return Err(PackError::ConfigInvalid(
                    "run image must be specified".to_string(),
                ));
            }
            let stack = &metadata.stack.run_image;
            let mirrors = opts
                .run_image_mirrors
                .get(&stack.image)
                .map(Vec::as_slice)
                .unwrap_or_default();
            select_run_image(&opts.image, stack, mirrors)
        }
    };
    let new_base = fetcher.fetch(&run_image, daemon, opts.pull).await?;

    info!("Rebasing {} on run image {}", opts.image, run_image);
    rebase_image(image.as_mut(), new_base.as_ref()).await?;
    let id = image.save(&opts.additional_tags).await?;
    info!("Rebased {}", opts.image);
    Ok(id)
}
