//! Remote backed by the `git` executable and a local repository

use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

use super::{ref_selected, Advertisement, Negotiation, Remote};
use crate::cancel::CancelToken;
use crate::error::{Error, Result, ResultExt};
use crate::object::ObjectId;

const CAPABILITIES: [&str; 2] = ["ofs-delta", "filter"];

/// How often a running transfer looks at its cancel token.
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Reads refs and packs straight out of a repository on disk, the same way
/// `upload-pack` would serve them.
pub struct GitRemote {
    repo: PathBuf,
}

impl GitRemote {
    /// `repo` may be a work tree or a bare repository.
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    fn git(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.repo);
        cmd
    }

    /// Run a git subcommand to completion and return its stdout.
    fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = self
            .git()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(Error::Protocol(format!(
                "git {} in {} failed with {}: {}",
                args.join(" "),
                self.repo.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    fn head(&self) -> Result<Option<ObjectId>> {
        let status = self
            .git()
            .args(["rev-parse", "--verify", "--quiet", "HEAD"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("Failed to run git rev-parse")?;
        // Unborn HEAD in an empty repository.
        if !status.success() {
            return Ok(None);
        }
        let out = self.run(&["rev-parse", "--verify", "HEAD"])?;
        parse_hex_line(&out).map(Some)
    }
}

fn parse_hex_line(line: &[u8]) -> Result<ObjectId> {
    let text = String::from_utf8_lossy(line);
    ObjectId::from_hex(text.trim())
        .map_err(|e| Error::Protocol(format!("git printed a bad object name {text:?}: {e}")))
}

impl Remote for GitRemote {
    fn list_refs(&mut self, prefixes: &[String]) -> Result<Advertisement> {
        let mut advertisement = Advertisement {
            capabilities: CAPABILITIES.into_iter().collect(),
            ..Default::default()
        };

        if ref_selected("HEAD", prefixes) {
            if let Some(head) = self.head()? {
                advertisement.refs.insert("HEAD".to_string(), head);
            }
        }

        let listing = self.run(&["for-each-ref", "--format=%(objectname) %(refname)"])?;
        for line in listing.split(|&b| b == b'\n').filter(|l| !l.is_empty()) {
            let text = String::from_utf8_lossy(line);
            let Some((hash, name)) = text.split_once(' ') else {
                return Err(Error::Protocol(format!("unexpected for-each-ref line {text:?}")));
            };
            if ref_selected(name, prefixes) {
                advertisement
                    .refs
                    .insert(name.to_string(), parse_hex_line(hash.as_bytes())?);
            }
        }

        debug!(repo = %self.repo.display(), refs = advertisement.refs.len(), "Listed refs");
        Ok(advertisement)
    }

    fn negotiate(
        &mut self,
        want: &[ObjectId],
        filter: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<Negotiation<'_>> {
        let mut cmd = self.git();
        cmd.args(["pack-objects", "--revs", "--stdout", "--delta-base-offset", "-q"]);
        if let Some(filter) = filter {
            cmd.arg(format!("--filter={filter}"));
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .context("Failed to spawn git pack-objects")?;

        send_wants(&mut child, want)?;

        debug!(wants = want.len(), ?filter, "Streaming pack from git pack-objects");
        let process = PackProcess::new(child, cancel.clone())?;
        Ok(Negotiation {
            capabilities: CAPABILITIES.into_iter().collect(),
            pack: Box::new(BufReader::with_capacity(64 * 1024, process)),
        })
    }
}

/// Write the want list to the child's stdin and close it. On failure the
/// child is killed and the write error returned.
fn send_wants(child: &mut Child, want: &[ObjectId]) -> Result<()> {
    // The want list is small; pack-objects only starts writing once stdin closes.
    let written = match child.stdin.take() {
        Some(mut stdin) => want
            .iter()
            .try_for_each(|id| writeln!(stdin, "{id}"))
            .context("Failed to send wants to git pack-objects"),
        None => Err(Error::Protocol("git pack-objects has no stdin".into())),
    };
    if written.is_err() {
        let _ = child.kill();
        let _ = child.wait();
    }
    written
}

/// Stdout of a running `pack-objects`. EOF is only reported once the
/// process has exited successfully; dropping early kills it.
///
/// A watcher thread kills the process as soon as the cancel token fires, so a
/// read blocked on the pipe returns and fails with [`Error::Cancelled`].
struct PackProcess {
    child: Arc<Mutex<Child>>,
    stdout: ChildStdout,
    cancel: CancelToken,
    finished: bool,
    stop: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

impl PackProcess {
    fn new(mut child: Child, cancel: CancelToken) -> Result<Self> {
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Protocol("git pack-objects has no stdout".into()));
        };
        let child = Arc::new(Mutex::new(child));
        let stop = Arc::new(AtomicBool::new(false));
        let watcher = {
            let (child, stop, cancel) = (child.clone(), stop.clone(), cancel.clone());
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    if cancel.is_cancelled() {
                        if let Ok(mut child) = child.lock() {
                            debug!("Cancelled; killing git pack-objects");
                            let _ = child.kill();
                        }
                        return;
                    }
                    thread::sleep(CANCEL_POLL);
                }
            })
        };
        Ok(Self {
            child,
            stdout,
            cancel,
            finished: false,
            stop,
            watcher: Some(watcher),
        })
    }

    fn stop_watcher(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.join();
        }
    }

    fn cancelled(&self) -> io::Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled.into_io())
        } else {
            Ok(())
        }
    }

    fn wait(&mut self) -> io::Result<()> {
        self.stop_watcher();
        self.finished = true;
        let status = self
            .child
            .lock()
            .map_err(|_| io::Error::other("git pack-objects handle poisoned"))?
            .wait()?;
        self.cancelled()?;
        if !status.success() {
            return Err(Error::Protocol(format!("git pack-objects exited with {status}")).into_io());
        }
        Ok(())
    }
}

impl Read for PackProcess {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cancelled()?;
        let read = self.stdout.read(buf);
        // A kill from the watcher shows up as EOF or a broken read.
        self.cancelled()?;
        let n = read?;
        if n == 0 && !buf.is_empty() && !self.finished {
            self.wait()?;
        }
        Ok(n)
    }
}

impl Drop for PackProcess {
    fn drop(&mut self) {
        self.stop_watcher();
        if !self.finished {
            if let Ok(mut child) = self.child.lock() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}
