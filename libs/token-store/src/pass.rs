use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::record::TokenRecord;
use crate::store::SecretsBackend;
use crate::StoreError;

const TOKENS_BASE: &str = "gordon/registry/tokens";
const REVOKED_PATH: &str = "gordon/registry/revoked";

/// Token backend storing entries in the `pass` password manager.
///
/// Every operation is a fixed-argument `pass` invocation; the subject is
/// only ever passed as a data argument, never through a shell. Each subject
/// occupies two entries: `<base>/<subject>` holds the raw JWT and
/// `<base>/<subject>.meta` holds the JSON metadata.
pub struct PassVault {
    _private: (),
}

impl PassVault {
    /// Construct the backend, verifying the `pass` binary is usable.
    pub async fn new() -> Result<Self, StoreError> {
        let output = Command::new("pass")
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("pass binary not found: {e}"))
            })?;

        if !output.status.success() {
            return Err(StoreError::Unavailable(format!(
                "pass --version exited with {}",
                output.status
            )));
        }

        Ok(Self { _private: () })
    }

    fn token_path(subject: &str) -> String {
        format!("{TOKENS_BASE}/{subject}")
    }

    fn meta_path(subject: &str) -> String {
        format!("{TOKENS_BASE}/{subject}.meta")
    }

    /// `pass insert -m -f <path>` with the contents piped via stdin
    async fn insert(&self, path: &str, contents: &str) -> Result<(), StoreError> {
        let mut child = Command::new("pass")
            .arg("insert")
            .arg("-m")
            .arg("-f")
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StoreError::Backend(format!("failed to spawn pass insert: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| StoreError::Backend("pass insert stdin unavailable".to_string()))?;
        stdin
            .write_all(contents.as_bytes())
            .await
            .map_err(|e| StoreError::Backend(format!("failed to write to pass insert: {e}")))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StoreError::Backend(format!("pass insert failed: {e}")))?;
        if !output.status.success() {
            return Err(StoreError::Backend(format!(
                "pass insert {} exited with {}: {}",
                path,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// `pass show <path>`; `Ok(None)` when the entry does not exist
    async fn show(&self, path: &str) -> Result<Option<String>, StoreError> {
        let output = Command::new("pass")
            .arg("show")
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| StoreError::Backend(format!("failed to spawn pass show: {e}")))?;

        if output.status.success() {
            let contents = String::from_utf8_lossy(&output.stdout);
            return Ok(Some(contents.trim_end_matches('\n').to_string()));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("is not in the password store") {
            return Ok(None);
        }
        Err(StoreError::Backend(format!(
            "pass show {} exited with {}: {}",
            path,
            output.status,
            stderr.trim()
        )))
    }

    /// `pass rm -f <path>`; missing entries are not an error
    async fn remove_entry(&self, path: &str) -> Result<(), StoreError> {
        let output = Command::new("pass")
            .arg("rm")
            .arg("-f")
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| StoreError::Backend(format!("failed to spawn pass rm: {e}")))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("is not in the password store") {
            return Ok(());
        }
        Err(StoreError::Backend(format!(
            "pass rm {} exited with {}: {}",
            path,
            output.status,
            stderr.trim()
        )))
    }
}

#[async_trait::async_trait]
impl SecretsBackend for PassVault {
    async fn store(
        &self,
        subject: &str,
        jwt: &str,
        record: &TokenRecord,
    ) -> Result<(), StoreError> {
        let meta = serde_json::to_string(record)?;
        self.insert(&Self::token_path(subject), jwt).await?;
        self.insert(&Self::meta_path(subject), &meta).await?;
        debug!(subject, "stored token in pass");
        Ok(())
    }

    async fn load(&self, subject: &str) -> Result<Option<(String, TokenRecord)>, StoreError> {
        let Some(jwt) = self.show(&Self::token_path(subject)).await? else {
            return Ok(None);
        };
        let Some(meta) = self.show(&Self::meta_path(subject)).await? else {
            warn!(subject, "token entry has no .meta companion, ignoring");
            return Ok(None);
        };
        let record: TokenRecord = serde_json::from_str(&meta)?;
        Ok(Some((jwt, record)))
    }

    async fn remove(&self, subject: &str) -> Result<(), StoreError> {
        self.remove_entry(&Self::token_path(subject)).await?;
        self.remove_entry(&Self::meta_path(subject)).await
    }

    async fn list_subjects(&self) -> Result<Vec<String>, StoreError> {
        let output = Command::new("pass")
            .arg("ls")
            .arg(TOKENS_BASE)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| StoreError::Backend(format!("failed to spawn pass ls: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("is not in the password store") {
                return Ok(Vec::new());
            }
            return Err(StoreError::Backend(format!(
                "pass ls exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        let subjects = parse_tree(&listing)
            .into_iter()
            .filter(|subject| !subject.ends_with(".meta"))
            .collect();
        Ok(subjects)
    }

    async fn load_revoked(&self) -> Result<Vec<String>, StoreError> {
        match self.show(REVOKED_PATH).await? {
            Some(contents) => Ok(serde_json::from_str(&contents)?),
            None => Ok(Vec::new()),
        }
    }

    async fn store_revoked(&self, ids: &[String]) -> Result<(), StoreError> {
        let contents = serde_json::to_string(ids)?;
        self.insert(REVOKED_PATH, &contents).await
    }
}

/// One entry of a `pass ls` tree
struct TreeEntry {
    depth: usize,
    name: String,
}

/// Parse the tree rendering of `pass ls` into slash-joined entry paths.
///
/// `pass` delegates to `tree(1)`, which indents each nesting level by
/// exactly four columns and marks entries with either Unicode branch
/// characters (`├── `, `└── `, `│   `) or their ASCII fallbacks (`|-- `,
/// `` `-- ``, `|   `). Depth is the number of runes before the branch
/// marker divided by four. Only leaves are returned; an entry followed by
/// a deeper one is a directory.
fn parse_tree(listing: &str) -> Vec<String> {
    let entries: Vec<TreeEntry> = listing
        .lines()
        .skip(1) // first line is the base directory itself
        .filter_map(parse_tree_line)
        .collect();

    let mut paths = Vec::new();
    let mut stack: Vec<String> = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        stack.truncate(entry.depth);
        stack.push(entry.name.clone());

        let is_leaf = entries
            .get(i + 1)
            .is_none_or(|next| next.depth <= entry.depth);
        if is_leaf {
            paths.push(stack.join("/"));
        }
    }

    paths
}

fn parse_tree_line(line: &str) -> Option<TreeEntry> {
    let line = strip_ansi(line);

    for marker in ["├── ", "└── ", "|-- ", "`-- "] {
        if let Some(pos) = line.find(marker) {
            let depth = line[..pos].chars().count() / 4;
            let name = line[pos + marker.len()..].trim_end();
            if name.is_empty() {
                return None;
            }
            return Some(TreeEntry {
                depth,
                name: name.to_string(),
            });
        }
    }
    None
}

/// Drop ANSI SGR color sequences `pass` emits when it thinks it has a tty
fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' && chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}
