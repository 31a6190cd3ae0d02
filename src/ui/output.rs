//! Output functions for consistent CLI formatting

use super::context::UiContext;
use console::style;

/// Display a section header
pub fn section(ctx: &UiContext, title: &str) {
    println!();
    if ctx.is_interactive() {
        println!("{}", style(title).bold().cyan());
    } else {
        println!("{}", title);
    }
}

/// Display a success step
pub fn step_ok(ctx: &UiContext, message: &str) {
    if ctx.is_interactive() {
        cliclack::log::success(message).ok();
    } else {
        println!("{} {}", style("[OK]").green(), message);
    }
}

/// Display a warning step
pub fn step_warn(ctx: &UiContext, message: &str) {
    if ctx.is_interactive() {
        cliclack::log::warning(message).ok();
    } else {
        println!("{} {}", style("[WARN]").yellow(), message);
    }
}

/// Display a remark/hint
pub fn remark(ctx: &UiContext, message: &str) {
    if ctx.is_interactive() {
        println!("{}", style(message).dim());
    } else {
        println!("{}", message);
    }
}

/// Print an indented key-value pair
pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    if ctx.is_interactive() {
        println!("  {}: {}", style(key).dim(), value);
    } else {
        println!("  {}: {}", key, value);
    }
}

/// Print an indented list entry, `(none)` style placeholders included
pub fn list_item(ctx: &UiContext, indent: usize, item: &str) {
    let pad = " ".repeat(indent * 2);
    if ctx.is_interactive() && item.starts_with('(') {
        println!("{}{}", pad, style(item).dim());
    } else {
        println!("{}{}", pad, item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_non_interactive() {
        let ctx = UiContext::non_interactive();
        // These should not panic
        section(&ctx, "Buildpacks:");
        step_ok(&ctx, "Saved");
        step_warn(&ctx, "Warning");
        key_value(&ctx, "Stack", "stacks.bionic");
        list_item(&ctx, 2, "(none)");
        remark(&ctx, "hint");
    }
}
