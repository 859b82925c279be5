//! Filesystem-backed rule loading with content hashing.
//!
//! Scans a directory (recursively) for `*.yml` / `*.yaml` files and
//! deserializes each into a [`Rule`] plus its constructed collaborators
//! (detector, alerters, enhancements). Parse errors are reported
//! per-file and do not abort the scan.
//!
//! The engine detects rule changes by re-hashing file contents on its
//! own cadence, so the loader exposes [`get_hashes`](RuleLoader::get_hashes)
//! rather than a filesystem watcher.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use searchlight_core::Config;
use searchlight_notify::Alerter;

use crate::alerts::build_alerters;
use crate::detector::{build_detector, Detector};
use crate::enhancement::{build_enhancements, Enhancement};
use crate::error::{Result, RuleError};
use crate::schema::Rule;

/// A rule together with its constructed collaborators.
pub struct LoadedRule {
    pub rule: Rule,
    pub detector: Box<dyn Detector>,
    pub alerters: Vec<Box<dyn Alerter>>,
    pub enhancements: Vec<Box<dyn Enhancement>>,
    pub source_path: PathBuf,
    /// SHA-256 of the file contents at load time.
    pub hash: String,
}

/// Outcome of loading one rule file.
pub struct LoadOutcome {
    pub path: PathBuf,
    pub result: Result<LoadedRule>,
}

/// Filesystem-backed rule loader.
pub struct RuleLoader {
    rules_dir: PathBuf,
}

impl RuleLoader {
    pub fn new(rules_dir: PathBuf) -> Self {
        Self { rules_dir }
    }

    pub fn rules_dir(&self) -> &Path {
        &self.rules_dir
    }

    /// Load every rule file (or just `rule_filter` when given, for
    /// single-rule mode). Per-file failures are captured, not fatal.
    pub fn load(&self, conf: &Config, rule_filter: Option<&Path>) -> Result<Vec<LoadOutcome>> {
        let files = match rule_filter {
            Some(filter) => vec![self.resolve_filter(filter)?],
            None => self.scan()?,
        };
        let mut outcomes = Vec::with_capacity(files.len());
        for path in files {
            let result = self.load_configuration(&path, conf);
            match &result {
                Ok(loaded) => {
                    info!(rule = %loaded.rule.name, path = %path.display(), "loaded rule")
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to load rule file"),
            }
            outcomes.push(LoadOutcome { path, result });
        }
        Ok(outcomes)
    }

    /// Parse a single rule file and construct its collaborators.
    pub fn load_configuration(&self, path: &Path, conf: &Config) -> Result<LoadedRule> {
        let contents = fs::read_to_string(path)?;
        let hash = hash_contents(&contents);

        let mut rule: Rule = serde_yaml::from_str(&contents)?;
        rule.finalize(conf)?;

        let detector = build_detector(&rule)?;
        let alerters = build_alerters(&rule, conf)?;
        let enhancements = build_enhancements(&rule)?;

        Ok(LoadedRule {
            rule,
            detector,
            alerters,
            enhancements,
            source_path: path.to_path_buf(),
            hash,
        })
    }

    /// Raw YAML of a rule file, for error reporting (e.g. extracting
    /// `notify_email` from a rule whose schema no longer parses).
    pub fn load_yaml(&self, path: &Path) -> Result<serde_yaml::Value> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Content hashes for every rule file, keyed by path. The reload
    /// sweep compares these against the previous set.
    pub fn get_hashes(&self, rule_filter: Option<&Path>) -> Result<BTreeMap<PathBuf, String>> {
        let files = match rule_filter {
            Some(filter) => vec![self.resolve_filter(filter)?],
            None => self.scan()?,
        };
        let mut hashes = BTreeMap::new();
        for path in files {
            match fs::read_to_string(&path) {
                Ok(contents) => {
                    hashes.insert(path, hash_contents(&contents));
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to hash rule file"),
            }
        }
        Ok(hashes)
    }

    /// Recursively collect rule YAML files, skipping dotfiles.
    fn scan(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        self.scan_dir_recursive(&self.rules_dir, &mut files)?;
        files.sort();
        Ok(files)
    }

    fn scan_dir_recursive(&self, dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "failed to read rules directory");
                return Ok(());
            }
        };

        for entry in entries {
            let path = entry?.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with('.') {
                    continue;
                }
            }
            if path.is_dir() {
                self.scan_dir_recursive(&path, files)?;
                continue;
            }
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yml" || e == "yaml")
                .unwrap_or(false);
            if is_yaml {
                files.push(path);
            }
        }
        Ok(())
    }

    /// Resolve a `--rule` filter: absolute, relative to the rules dir,
    /// or a bare filename inside it.
    fn resolve_filter(&self, filter: &Path) -> Result<PathBuf> {
        if filter.is_file() {
            return Ok(filter.to_path_buf());
        }
        let joined = self.rules_dir.join(filter);
        if joined.is_file() {
            return Ok(joined);
        }
        Err(RuleError::NotFound(filter.to_path_buf()))
    }
}

fn hash_contents(contents: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn conf() -> Config {
        serde_yaml::from_str(
            "rules_folder: rules\nrun_every: {minutes: 1}\nbuffer_time: {minutes: 15}\nes_host: localhost\n",
        )
        .unwrap()
    }

    const VALID_RULE: &str = "\
name: demo
type: any
index: logs-*
alert: [debug]
";

    fn write_rule(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_valid_rule() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "demo.yml", VALID_RULE);
        let loader = RuleLoader::new(dir.path().to_path_buf());
        let outcomes = loader.load(&conf(), None).unwrap();
        assert_eq!(outcomes.len(), 1);
        let loaded = outcomes[0].result.as_ref().unwrap();
        assert_eq!(loaded.rule.name, "demo");
        assert_eq!(loaded.alerters.len(), 1);
        assert_eq!(loaded.hash.len(), 64);
    }

    #[test]
    fn invalid_rule_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "good.yml", VALID_RULE);
        write_rule(dir.path(), "bad.yml", "name: bad\ntype: nope\nindex: x\n");
        let loader = RuleLoader::new(dir.path().to_path_buf());
        let outcomes = loader.load(&conf(), None).unwrap();
        assert_eq!(outcomes.len(), 2);
        let failures: Vec<_> = outcomes.iter().filter(|o| o.result.is_err()).collect();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].path.ends_with("bad.yml"));
    }

    #[test]
    fn skips_dotfiles_and_non_yaml() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), ".hidden.yml", VALID_RULE);
        write_rule(dir.path(), "notes.txt", "not yaml");
        write_rule(dir.path(), "demo.yaml", VALID_RULE);
        let loader = RuleLoader::new(dir.path().to_path_buf());
        let outcomes = loader.load(&conf(), None).unwrap();
        assert_eq!(outcomes.len(), 1);
    }

    #[test]
    fn scans_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("team-a")).unwrap();
        write_rule(&dir.path().join("team-a"), "demo.yml", VALID_RULE);
        let loader = RuleLoader::new(dir.path().to_path_buf());
        let outcomes = loader.load(&conf(), None).unwrap();
        assert_eq!(outcomes.len(), 1);
    }

    #[test]
    fn hashes_change_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rule(dir.path(), "demo.yml", VALID_RULE);
        let loader = RuleLoader::new(dir.path().to_path_buf());
        let before = loader.get_hashes(None).unwrap();
        write_rule(dir.path(), "demo.yml", &format!("{VALID_RULE}realert: {{minutes: 5}}\n"));
        let after = loader.get_hashes(None).unwrap();
        assert_ne!(before.get(&path), after.get(&path));
    }

    #[test]
    fn rule_filter_accepts_bare_filename() {
        let dir = tempfile::tempdir().unwrap();
        write_rule(dir.path(), "demo.yml", VALID_RULE);
        write_rule(dir.path(), "other.yml", VALID_RULE.replace("demo", "other").as_str());
        let loader = RuleLoader::new(dir.path().to_path_buf());
        let outcomes = loader.load(&conf(), Some(Path::new("demo.yml"))).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].path.ends_with("demo.yml"));
    }

    #[test]
    fn missing_rule_filter_errors() {
        let dir = tempfile::tempdir().unwrap();
        let loader = RuleLoader::new(dir.path().to_path_buf());
        assert!(matches!(
            loader.load(&conf(), Some(Path::new("ghost.yml"))),
            Err(RuleError::NotFound(_))
        ));
    }
}
