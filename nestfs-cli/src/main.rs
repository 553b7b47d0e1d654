//! `nestfs-mkfs`: format, check and inspect nestfs images from the shell.
//!
//! Argument parsing is hand-rolled rather than pulled in from a crate,
//! matching the rest of this pack's CLI tools.

use std::path::PathBuf;
use std::process::ExitCode;

use nestfs::{FileStorage, FileType, Filesystem};

fn usage() -> ! {
    eprintln!("usage: nestfs-mkfs <command> <image> [args...]");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  format <image>            create a fresh, empty filesystem image");
    eprintln!("  check <image>             validate allocator and tree consistency");
    eprintln!("  ls <image> [path]         list a directory (default: /)");
    std::process::exit(2);
}

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let command = match args.next() {
        Some(c) => c,
        None => usage(),
    };
    let image = match args.next() {
        Some(p) => PathBuf::from(p),
        None => usage(),
    };

    let result = match command.as_str() {
        "format" => cmd_format(&image),
        "check" => cmd_check(&image),
        "ls" => cmd_ls(&image, args.next().as_deref().unwrap_or("/")),
        _ => usage(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("nestfs-mkfs: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_format(image: &PathBuf) -> nestfs::Result<()> {
    let storage = FileStorage::open(image)?;
    Filesystem::format(storage)?;
    log::info!("formatted {}", image.display());
    Ok(())
}

fn cmd_check(image: &PathBuf) -> nestfs::Result<()> {
    let storage = FileStorage::open(image)?;
    let mut fs = Filesystem::open(storage)?;
    fs.check()?;
    println!("ok");
    Ok(())
}

fn cmd_ls(image: &PathBuf, path: &str) -> nestfs::Result<()> {
    let storage = FileStorage::open(image)?;
    let mut fs = Filesystem::open(storage)?;
    if fs.file_type(path)? != FileType::Directory {
        eprintln!("nestfs-mkfs: {path}: not a directory");
        std::process::exit(1);
    }
    for entry in fs.list_directory(path)? {
        let kind = if entry.is_directory { "d" } else { "-" };
        let name = String::from_utf8_lossy(&entry.name);
        println!("{kind} {:>6} {name}", entry.inode);
    }
    Ok(())
}
