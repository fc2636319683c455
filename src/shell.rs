//! Command surface over a `FileSystem`: one command per line, rendered replies,
//! script replay.

use super::*;
use disk::InodeKind;
use fs::FileSystem;
use ops::{InodeInfo, Listing, Usage};

use log::{info, warn};
use std::path::{Path, PathBuf};

const HELP: &str = "\
format SIZE            lay out a new image of SIZE MiB (10, 10M or 10MB)
mkdir PATH             create a directory
rmdir PATH             remove an empty directory
rm PATH                remove a file
mv SRC DST             move or rename
cp SRC DST             copy a file
cd PATH                change the working directory
pwd                    print the working directory
ls [PATH]              list a directory (+dir, -file)
cat PATH               print a file
info PATH              inode and links of PATH
incp HOST PATH         copy a host file in
outcp PATH HOST        copy a file out to the host
fsck                   check and repair the image
statfs                 free blocks and inodes
load SCRIPT            run the commands in SCRIPT
exit | quit            close the image and leave";

/// What a command produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Done,
    Text(String),
    Exit,
}

/// Outcome of one script line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptLine {
    pub line: usize,
    pub command: String,
    pub ok: bool,
    pub message: String,
}

impl std::fmt::Display for ScriptLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.ok { "OK" } else { "FAIL" };
        write!(f, "{:>3}: {} ... {status}", self.line, self.command)?;
        if !self.ok {
            write!(f, " ({})", self.message)?;
        }
        Ok(())
    }
}

pub struct Shell {
    image: PathBuf,
    fs: Option<FileSystem>,
    last_error: Option<ErrorKind>,
    loading: bool,
}

impl Shell {
    /// Mounts `image` when it holds a filesystem; otherwise only `format` works.
    pub fn open(image: impl Into<PathBuf>) -> Result<Self> {
        let image = image.into();
        let fs = match FileSystem::open(&image) {
            Ok(fs) => Some(fs),
            Err(FsError::NotFormatted) => {
                warn!("{} is not formatted yet", image.display());
                None
            }
            Err(err) => return Err(err),
        };
        Ok(Self {
            image,
            fs,
            last_error: None,
            loading: false,
        })
    }

    pub fn is_mounted(&self) -> bool {
        self.fs.is_some()
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// Working directory as `path> `; reading it leaves `last_error` alone.
    pub fn prompt(&self) -> String {
        match self
            .fs
            .as_ref()
            .map(|fs| path::path_to_root(fs.volume(), fs.cwd()))
        {
            Some(Ok(cwd)) => format!("{cwd}> "),
            Some(Err(_)) => "?> ".to_owned(),
            None => "(unformatted)> ".to_owned(),
        }
    }

    /// Runs one line. Blank lines and `#` comments do nothing.
    pub fn exec(&mut self, line: &str) -> Result<Reply> {
        let result = self.dispatch(line);
        if let Err(err) = &result {
            self.last_error = Some(err.kind());
        }
        result
    }

    fn dispatch(&mut self, line: &str) -> Result<Reply> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = words.split_first() else {
            return Ok(Reply::Done);
        };
        if command.starts_with('#') {
            return Ok(Reply::Done);
        }

        match command {
            "format" => {
                arity(args, 1)?;
                let size = args[0];
                let size_mb = parse_size(size)?;
                if let Some(fs) = self.fs.take() {
                    fs.close()?;
                }
                self.fs = Some(FileSystem::format(&self.image, size_mb)?);
                Ok(Reply::Done)
            }
            "mkdir" => {
                arity(args, 1)?;
                let path = args[0];
                self.mounted()?.mkdir(path)?;
                Ok(Reply::Done)
            }
            "rmdir" => {
                arity(args, 1)?;
                let path = args[0];
                self.mounted()?.rmdir(path)?;
                Ok(Reply::Done)
            }
            "rm" => {
                arity(args, 1)?;
                let path = args[0];
                self.mounted()?.rm(path)?;
                Ok(Reply::Done)
            }
            "mv" => {
                arity(args, 2)?;
                let src = args[0];
                let dst = args[1];
                self.mounted()?.mv(src, dst)?;
                Ok(Reply::Done)
            }
            "cp" => {
                arity(args, 2)?;
                let src = args[0];
                let dst = args[1];
                self.mounted()?.cp(src, dst)?;
                Ok(Reply::Done)
            }
            "cd" => {
                arity(args, 1)?;
                let path = args[0];
                self.mounted()?.cd(path)?;
                Ok(Reply::Done)
            }
            "pwd" => {
                arity(args, 0)?;
                Ok(Reply::Text(self.mounted()?.pwd()?))
            }
            "ls" => {
                let path = match args {
                    [] => None,
                    [path] => Some(*path),
                    _ => return Err(too_many()),
                };
                let listing = self.mounted()?.ls(path)?;
                Ok(Reply::Text(render_listing(&listing)))
            }
            "cat" => {
                arity(args, 1)?;
                let path = args[0];
                let data = self.mounted()?.cat(path)?;
                Ok(Reply::Text(String::from_utf8_lossy(&data).into_owned()))
            }
            "info" => {
                arity(args, 1)?;
                let path = args[0];
                Ok(Reply::Text(render_info(&self.mounted()?.info(path)?)))
            }
            "incp" => {
                arity(args, 2)?;
                let host = args[0];
                let path = args[1];
                self.mounted()?.incp(Path::new(host), path)?;
                Ok(Reply::Done)
            }
            "outcp" => {
                arity(args, 2)?;
                let path = args[0];
                let host = args[1];
                self.mounted()?.outcp(path, Path::new(host))?;
                Ok(Reply::Done)
            }
            "fsck" => {
                arity(args, 0)?;
                Ok(Reply::Text(self.mounted()?.fsck()?.to_string()))
            }
            "statfs" => {
                arity(args, 0)?;
                Ok(Reply::Text(render_usage(&self.mounted()?.statfs()?)))
            }
            "load" => {
                arity(args, 1)?;
                let script = args[0];
                let lines = self.load(Path::new(script))?;
                let text: Vec<String> = lines.iter().map(ScriptLine::to_string).collect();
                Ok(Reply::Text(text.join("\n")))
            }
            "help" => Ok(Reply::Text(HELP.to_owned())),
            "exit" | "quit" => {
                arity(args, 0)?;
                Ok(Reply::Exit)
            }
            _ => Err(FsError::InvalidArgument(format!("unknown command `{command}`"))),
        }
    }

    /// Replays `script` line by line. A failing line is reported and the next one
    /// runs anyway; `exit` ends the replay.
    pub fn load(&mut self, script: &Path) -> Result<Vec<ScriptLine>> {
        if self.loading {
            return Err(FsError::InvalidArgument("load cannot be nested".to_owned()));
        }
        let text = std::fs::read_to_string(script)?;
        info!("loading {}", script.display());

        self.loading = true;
        let mut lines = Vec::new();
        for (number, command) in text.lines().enumerate() {
            let command = command.trim();
            if command.is_empty() || command.starts_with('#') {
                continue;
            }
            let (ok, message, exit) = match self.exec(command) {
                Ok(Reply::Exit) => (true, "OK".to_owned(), true),
                Ok(Reply::Text(text)) => (true, text, false),
                Ok(Reply::Done) => (true, "OK".to_owned(), false),
                Err(err) => (false, err.to_string(), false),
            };
            lines.push(ScriptLine {
                line: number + 1,
                command: command.to_owned(),
                ok,
                message,
            });
            if exit {
                break;
            }
        }
        self.loading = false;
        Ok(lines)
    }

    /// Flushes and releases the image.
    pub fn close(self) -> Result<()> {
        match self.fs {
            Some(fs) => fs.close(),
            None => Ok(()),
        }
    }

    fn mounted(&mut self) -> Result<&mut FileSystem> {
        self.fs.as_mut().ok_or(FsError::NotFormatted)
    }
}

/// Exactly `n` arguments.
fn arity(args: &[&str], n: usize) -> Result<()> {
    if args.len() < n {
        return Err(FsError::ArgumentMissing);
    }
    if args.len() > n {
        return Err(too_many());
    }
    Ok(())
}

fn too_many() -> FsError {
    FsError::InvalidArgument("too many arguments".to_owned())
}

/// `10`, `10M` and `10MB` all mean 10 MiB.
fn parse_size(raw: &str) -> Result<u64> {
    let upper = raw.to_ascii_uppercase();
    let digits = upper
        .strip_suffix("MB")
        .or_else(|| upper.strip_suffix('M'))
        .unwrap_or(&upper);
    match digits.parse::<u64>() {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(FsError::InvalidArgument(format!("bad size `{raw}`"))),
    }
}

fn render_listing(listing: &[Listing]) -> String {
    listing
        .iter()
        .map(|entry| match entry.kind {
            InodeKind::Directory => format!("+{}", entry.name),
            _ => format!("-{}", entry.name),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_info(info: &InodeInfo) -> String {
    let kind = match info.kind {
        InodeKind::Directory => "dir",
        InodeKind::File => "file",
        InodeKind::Free => "free",
    };
    format!(
        "{} ({kind}) inode {} size {}\ndata links {:?}\nindex links {:?}",
        info.name, info.id, info.file_size, info.data_links, info.index_links
    )
}

fn render_usage(usage: &Usage) -> String {
    format!(
        "blocks {}/{} free ({} bytes each), inodes {}/{} free",
        usage.free_blocks,
        usage.total_blocks,
        usage.block_size,
        usage.free_inodes,
        usage.total_inodes
    )
}
