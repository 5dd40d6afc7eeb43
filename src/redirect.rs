//! Redirect rule table
//!
//! Prefix-keyed redirect rules persisted as one JSON file per rule. The
//! in-memory index is a concurrent map, so lookups and edits can come from
//! any request task without outside locking.
//!
//! Rule files use the `RedirectURL`/`TargetURL`/`ForwardChildpath`/`StatusCode`
//! field names, so existing redirect directories load unchanged. Each indexed
//! rule remembers the file it lives in, and new files are named by a
//! percent-encoded match prefix so two prefixes never share a file.

use crate::error::RedirectError;
use dashmap::DashMap;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// A single redirect rule, keyed by its match prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectRule {
    #[serde(rename = "RedirectURL", alias = "match_prefix")]
    pub match_prefix: String,
    #[serde(rename = "TargetURL", alias = "target_url")]
    pub target_url: String,
    #[serde(rename = "ForwardChildpath", alias = "forward_child_path")]
    pub forward_child_path: bool,
    #[serde(rename = "StatusCode", alias = "status_code")]
    pub status_code: u16,
}

/// Bytes kept literally in rule file names; everything else, `%` included,
/// is escaped
const RULE_FILE_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

impl RedirectRule {
    /// Compute the Location for a request URL that matched this rule.
    ///
    /// With child path forwarding, whatever follows the match prefix in the
    /// request URL is appended to the target with a single joining slash.
    /// Targets without a scheme are treated as `http://`.
    pub fn target_for(&self, request_url: &str) -> String {
        let mut target = self.target_url.clone();

        if self.forward_child_path {
            let child = request_url
                .strip_prefix(self.match_prefix.as_str())
                .unwrap_or("");
            if !child.is_empty() && !child.starts_with('?') {
                target = join_child_path(&target, child);
            } else {
                target.push_str(child);
            }
        }

        if !target.starts_with("http://") && !target.starts_with("https://") {
            target = format!("http://{}", target);
        }

        target
    }
}

fn join_child_path(base: &str, child: &str) -> String {
    match (base.ends_with('/'), child.starts_with('/')) {
        (true, true) => format!("{}{}", base, &child[1..]),
        (false, false) => format!("{}/{}", base, child),
        _ => format!("{}{}", base, child),
    }
}

/// An indexed rule and the file backing it
#[derive(Clone)]
struct StoredRule {
    rule: Arc<RedirectRule>,
    path: PathBuf,
}

/// Concurrent, file-backed table of redirect rules
pub struct RedirectRuleTable {
    config_dir: PathBuf,
    rules: DashMap<String, StoredRule>,
}

impl RedirectRuleTable {
    /// Load every `*.json` rule under `config_dir`, creating the directory
    /// if needed. Unreadable or malformed files are logged and skipped.
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self, RedirectError> {
        let config_dir = config_dir.as_ref().to_path_buf();
        fs::create_dir_all(&config_dir).map_err(|source| RedirectError::Io {
            path: config_dir.clone(),
            source,
        })?;

        let table = Self {
            config_dir,
            rules: DashMap::new(),
        };

        let entries = fs::read_dir(&table.config_dir).map_err(|source| RedirectError::Io {
            path: table.config_dir.clone(),
            source,
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let rule = match fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|b| serde_json::from_slice::<RedirectRule>(&b).map_err(|e| e.to_string()))
            {
                Ok(rule) => rule,
                Err(e) => {
                    warn!("Skipping redirect rule {}: {}", path.display(), e);
                    continue;
                }
            };

            info!("Redirection rule added: {} -> {}", rule.match_prefix, rule.target_url);
            let stored = StoredRule {
                rule: Arc::new(rule),
                path: path.clone(),
            };
            if let Some(previous) = table.rules.insert(stored.rule.match_prefix.clone(), stored) {
                warn!(
                    "Redirect rule {} is also defined in {}, keeping {}",
                    previous.rule.match_prefix,
                    previous.path.display(),
                    path.display()
                );
            }
        }

        Ok(table)
    }

    /// Directory holding the rule files
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Add or replace the rule for `match_prefix`.
    ///
    /// The rule file is written first; the in-memory index only changes once
    /// the rule is durable. A replaced rule keeps the file it was loaded
    /// from.
    pub fn add(
        &self,
        match_prefix: &str,
        target_url: &str,
        forward_child_path: bool,
        status_code: u16,
    ) -> Result<(), RedirectError> {
        if match_prefix.is_empty() {
            return Err(RedirectError::Invalid("match prefix is empty".into()));
        }
        if target_url.is_empty() {
            return Err(RedirectError::Invalid("target url is empty".into()));
        }
        if !(300..400).contains(&status_code) {
            return Err(RedirectError::Invalid(format!(
                "status code {} is not a redirect",
                status_code
            )));
        }

        let rule = RedirectRule {
            match_prefix: match_prefix.to_string(),
            target_url: target_url.to_string(),
            forward_child_path,
            status_code,
        };

        let existing = self.rules.get(match_prefix).map(|stored| stored.path.clone());
        let path = match existing {
            Some(path) => path,
            None => {
                let path = self.rule_path(match_prefix);
                let owner = self
                    .rules
                    .iter()
                    .find(|stored| stored.value().path == path)
                    .map(|stored| stored.key().clone());
                if let Some(owner) = owner {
                    return Err(RedirectError::Conflict {
                        match_prefix: match_prefix.to_string(),
                        owner,
                        path,
                    });
                }
                path
            }
        };
        let tmp_path = path.with_extension("json.tmp");
        let encoded = serde_json::to_vec_pretty(&rule)?;

        fs::write(&tmp_path, &encoded)
            .and_then(|_| fs::rename(&tmp_path, &path))
            .map_err(|source| {
                let _ = fs::remove_file(&tmp_path);
                warn!("Error writing redirect rule {}: {}", path.display(), source);
                RedirectError::Io {
                    path: path.clone(),
                    source,
                }
            })?;

        self.rules.insert(
            rule.match_prefix.clone(),
            StoredRule {
                rule: Arc::new(rule),
                path,
            },
        );
        Ok(())
    }

    /// Remove the rule for `match_prefix` and the file backing it. A missing
    /// rule is not an error.
    pub fn delete(&self, match_prefix: &str) -> Result<(), RedirectError> {
        let path = match self.rules.get(match_prefix).map(|stored| stored.path.clone()) {
            Some(path) => path,
            None => return Ok(()),
        };

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                warn!("Error deleting redirect rule {}: {}", path.display(), source);
                return Err(RedirectError::Io { path, source });
            }
        }

        self.rules.remove(match_prefix);
        Ok(())
    }

    /// Snapshot of all rules, ordered by match prefix
    pub fn list_all(&self) -> Vec<RedirectRule> {
        let mut rules: Vec<RedirectRule> = self
            .rules
            .iter()
            .map(|entry| entry.value().rule.as_ref().clone())
            .collect();
        rules.sort_by(|a, b| a.match_prefix.cmp(&b.match_prefix));
        rules
    }

    /// Find the rule with the longest match prefix of `request_url`.
    /// Equal-length prefixes resolve to the lexicographically smallest key.
    pub fn match_url(&self, request_url: &str) -> Option<RedirectRule> {
        let mut best: Option<Arc<RedirectRule>> = None;

        for entry in self.rules.iter() {
            let key = entry.key();
            if !request_url.starts_with(key.as_str()) {
                continue;
            }

            let better = match &best {
                None => true,
                Some(current) => {
                    let current_key = &current.match_prefix;
                    key.len() > current_key.len()
                        || (key.len() == current_key.len() && key < current_key)
                }
            };

            if better {
                best = Some(entry.value().rule.clone());
            }
        }

        best.map(|rule| rule.as_ref().clone())
    }

    fn rule_path(&self, match_prefix: &str) -> PathBuf {
        self.config_dir
            .join(format!("{}.json", Self::rule_file_stem(match_prefix)))
    }

    /// Filesystem-safe file stem for a match prefix, distinct for every
    /// distinct prefix
    fn rule_file_stem(match_prefix: &str) -> String {
        utf8_percent_encode(match_prefix, RULE_FILE_ESCAPES).to_string()
    }
}
