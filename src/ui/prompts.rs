//! Interactive prompts with CI/non-interactive fallback

use super::context::UiContext;
use crate::error::{PackError, PackResult};

/// Prompt for one of `options` as (value, label, hint).
///
/// Returns `None` without prompting when not interactive.
pub async fn select<T: Clone + Send + Eq + 'static>(
    ctx: &UiContext,
    message: &str,
    options: &[(T, &str, &str)],
) -> PackResult<Option<T>> {
    if !ctx.is_interactive() || options.is_empty() {
        return Ok(None);
    }

    let message = message.to_string();
    let items: Vec<(T, String, String)> = options
        .iter()
        .map(|(v, l, h)| (v.clone(), l.to_string(), h.to_string()))
        .collect();

    let result = tokio::task::spawn_blocking(move || {
        let mut select = cliclack::select(&message);
        for (value, label, hint) in items {
            select = select.item(value, label, hint);
        }
        select.interact()
    })
    .await
    .map_err(|e| PackError::User(format!("Select task failed: {}", e)))?;

    result
        .map(Some)
        .map_err(|e| PackError::User(format!("Select failed: {}", e)))
}
