//! Terminal output for pack commands
//!
//! Uses `cliclack` for prompts and spinners when attached to a terminal and
//! falls back to plain lines in CI or when output is piped.

mod context;
mod output;
mod progress;
mod prompts;

pub use context::UiContext;
pub use output::{key_value, list_item, remark, section, step_ok, step_warn};
pub use progress::TaskSpinner;
pub use prompts::select;
