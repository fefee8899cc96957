//! An interactive shell for poking at an ext2 disk image through the VFS layer: a minimal
//! `mount(8)` plus BusyBox-style command set, enough to exercise every VFS operation by hand.

use anyhow::{bail, Context, Result};
use ext2fs::blockdev::FileBlockDevice;
use ext2fs::errno::Errno;
use ext2fs::fs::ext2::Ext2Fs;
use ext2fs::fs::{FileType, FilesystemOps, OFlags};
use ext2fs::perm::AccessProfile;
use ext2fs::vfs::{IoContext, Vfs};
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::rc::Rc;

struct Args {
    image: String,
    readonly: bool,
    uid: u32,
    gid: u32,
}

fn parse_args() -> Result<Args> {
    let mut image = None;
    let mut readonly = false;
    let mut uid = 0;
    let mut gid = 0;
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--readonly" => readonly = true,
            "--uid" => {
                uid = it
                    .next()
                    .context("--uid requires a value")?
                    .parse()
                    .context("--uid must be a number")?
            }
            "--gid" => {
                gid = it
                    .next()
                    .context("--gid requires a value")?
                    .parse()
                    .context("--gid must be a number")?
            }
            other if image.is_none() => image = Some(other.to_string()),
            other => bail!("unexpected argument: {other}"),
        }
    }
    Ok(Args {
        image: image.context("usage: ext2sh [--readonly] [--uid N] [--gid N] <image>")?,
        readonly,
        uid,
        gid,
    })
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ext2sh: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = parse_args()?;
    let dev = FileBlockDevice::open(&args.image, args.readonly)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("opening {}", args.image))?;
    let ext2 = Ext2Fs::mount(Box::new(dev), args.readonly).map_err(|e| anyhow::anyhow!("{e}"))?;
    let fs: Rc<dyn FilesystemOps> = ext2;
    let vfs = Vfs::new(fs.clone()).map_err(|e| anyhow::anyhow!("{e}"))?;
    let mut ctx = IoContext::new(AccessProfile::new(args.uid, args.gid), vfs.root());

    let stdin = io::stdin();
    print!("ext2sh> ");
    io::stdout().flush().ok();
    for line in stdin.lock().lines() {
        let line = line?;
        let words: Vec<&str> = line.split_whitespace().collect();
        if let Some(&cmd) = words.first() {
            if let Err(e) = dispatch(&vfs, &fs, &mut ctx, cmd, &words[1..]) {
                println!("error: {e}");
            }
        }
        print!("ext2sh> ");
        io::stdout().flush().ok();
    }
    Ok(())
}

fn dispatch(
    vfs: &Vfs,
    fs: &Rc<dyn FilesystemOps>,
    ctx: &mut IoContext,
    cmd: &str,
    args: &[&str],
) -> Result<(), Errno> {
    match cmd {
        "stat" => cmd_stat(vfs, ctx, arg(args, 0)?),
        "ls" => cmd_ls(vfs, ctx, arg(args, 0)?, false),
        "ll" => cmd_ls(vfs, ctx, arg(args, 0)?, true),
        "tree" => cmd_tree(vfs, ctx, args.first().copied().unwrap_or("."), 0),
        "cat" => cmd_cat(vfs, ctx, arg(args, 0)?),
        "cd" | "setcwd" => cmd_cd(vfs, ctx, arg(args, 0)?),
        "mkdir" => vfs.mkdir(ctx, arg(args, 0)?.as_bytes(), 0o755, ctx.profile.uid, ctx.profile.gid),
        "touch" => cmd_touch(vfs, ctx, arg(args, 0)?),
        "hello" => cmd_hello(vfs, ctx, arg(args, 0)?),
        "trunc" => cmd_trunc(vfs, ctx, arg(args, 0)?, arg(args, 1)?),
        "rm" => vfs.unlink(ctx, arg(args, 0)?.as_bytes()),
        "statvfs" | "df" => cmd_statvfs(fs),
        "help" => {
            print_help();
            Ok(())
        }
        other => {
            println!("unknown command: {other} (try `help`)");
            Ok(())
        }
    }
}

fn arg<'a>(args: &[&'a str], i: usize) -> Result<&'a str, Errno> {
    args.get(i).copied().ok_or(Errno::InvalidArgument)
}

fn print_help() {
    println!(
        "commands: stat ls ll tree cat cd setcwd mkdir touch hello trunc rm statvfs help exit"
    );
}

fn cmd_stat(vfs: &Vfs, ctx: &IoContext, path: &str) -> Result<(), Errno> {
    let stat = vfs.stat(ctx, path.as_bytes())?;
    println!(
        "ino={} type={:?} mode={:o} uid={} gid={} size={} blocks={}",
        stat.ino, stat.file_type, stat.mode, stat.uid, stat.gid, stat.size, stat.blocks
    );
    Ok(())
}

fn cmd_ls(vfs: &Vfs, ctx: &IoContext, path: &str, long: bool) -> Result<(), Errno> {
    let mut file = vfs.open(ctx, path.as_bytes(), OFlags::DIRECTORY)?;
    while let Some(entry) = file.readdir()? {
        if long {
            let entry_path = join(path, &entry.name);
            let stat = vfs.stat(ctx, &entry_path)?;
            println!(
                "{}{:o} {:>4} {:>4} {:>8} {}",
                type_char(stat.file_type),
                stat.mode,
                stat.uid,
                stat.gid,
                stat.size,
                String::from_utf8_lossy(&entry.name),
            );
        } else {
            println!("{}", String::from_utf8_lossy(&entry.name));
        }
    }
    Ok(())
}

fn type_char(ft: FileType) -> char {
    match ft {
        FileType::Directory => 'd',
        FileType::Regular => '-',
        FileType::Symlink => 'l',
    }
}

fn join(path: &str, name: &[u8]) -> Vec<u8> {
    let mut out = path.as_bytes().to_vec();
    if !out.ends_with(b"/") {
        out.push(b'/');
    }
    out.extend_from_slice(name);
    out
}

fn cmd_tree(vfs: &Vfs, ctx: &IoContext, path: &str, depth: usize) -> Result<(), Errno> {
    if depth == 0 {
        println!("{path}");
    }
    let stat = vfs.stat(ctx, path.as_bytes())?;
    if stat.file_type != FileType::Directory {
        return Ok(());
    }
    let mut file = vfs.open(ctx, path.as_bytes(), OFlags::DIRECTORY)?;
    while let Some(entry) = file.readdir()? {
        if entry.name == b"." || entry.name == b".." {
            continue;
        }
        println!(
            "{}{}",
            "  ".repeat(depth + 1),
            String::from_utf8_lossy(&entry.name)
        );
        let child_path = String::from_utf8_lossy(&join(path, &entry.name)).into_owned();
        if entry.d_type == FileType::Directory.to_dirent_indicator() {
            cmd_tree(vfs, ctx, &child_path, depth + 1)?;
        }
    }
    Ok(())
}

fn cmd_cat(vfs: &Vfs, ctx: &IoContext, path: &str) -> Result<(), Errno> {
    let mut file = vfs.open(ctx, path.as_bytes(), OFlags::empty())?;
    let mut buf = [0u8; 4096];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        io::stdout().write_all(&buf[..n]).ok();
    }
    Ok(())
}

fn cmd_cd(vfs: &Vfs, ctx: &mut IoContext, path: &str) -> Result<(), Errno> {
    ctx.cwd = vfs.chdir(ctx, path.as_bytes())?;
    Ok(())
}

fn cmd_touch(vfs: &Vfs, ctx: &IoContext, path: &str) -> Result<(), Errno> {
    match vfs.open(ctx, path.as_bytes(), OFlags::empty()) {
        Ok(_) => Ok(()),
        Err(Errno::NotFound) => {
            vfs.creat(ctx, path.as_bytes(), 0o644, ctx.profile.uid, ctx.profile.gid)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn cmd_hello(vfs: &Vfs, ctx: &IoContext, path: &str) -> Result<(), Errno> {
    let mut file = vfs.creat(ctx, path.as_bytes(), 0o644, ctx.profile.uid, ctx.profile.gid)?;
    file.write(b"hello world\n")?;
    Ok(())
}

fn cmd_trunc(vfs: &Vfs, ctx: &IoContext, path: &str, len: &str) -> Result<(), Errno> {
    let len: u64 = len.parse().map_err(|_| Errno::InvalidArgument)?;
    vfs.truncate(ctx, path.as_bytes(), len)
}

fn cmd_statvfs(fs: &Rc<dyn FilesystemOps>) -> Result<(), Errno> {
    let stat = fs.statvfs()?;
    println!(
        "blocks={}/{} inodes={}/{} bsize={}",
        stat.f_bfree, stat.f_blocks, stat.f_ffree, stat.f_files, stat.f_bsize
    );
    Ok(())
}
