//! Completion command - shell completion scripts

use crate::cli::args::{Cli, CompletionArgs};
use crate::config::pack_home;
use crate::error::{PackError, PackResult};
use clap::CommandFactory;
use clap_complete::{generate, Shell};
use std::io::Write;
use std::path::PathBuf;

/// Execute the completion command
pub fn execute(args: CompletionArgs) -> PackResult<()> {
    let script = script(args.shell);
    if args.save {
        let path = save(&script, args.shell)?;
        println!("{}", path.display());
        return Ok(());
    }
    std::io::stdout()
        .write_all(&script)
        .map_err(|e| PackError::io("writing completion script", e))
}

fn script(shell: Shell) -> Vec<u8> {
    let mut buf = Vec::new();
    generate(shell, &mut Cli::command(), "pack", &mut buf);
    buf
}

fn save(script: &[u8], shell: Shell) -> PackResult<PathBuf> {
    let dir = pack_home();
    std::fs::create_dir_all(&dir)
        .map_err(|e| PackError::io(format!("creating directory {}", dir.display()), e))?;
    let path = dir.join(format!("completion.{}", shell));
    std::fs::write(&path, script)
        .map_err(|e| PackError::io(format!("writing {}", path.display()), e))?;
    Ok(path)
}
