//! Script catalog, launch commands and backup listing.
//!
//! Catalog entries come from `[[scripts]]` in the config file. Loading checks
//! every entry against the filesystem and keeps only files that exist, are
//! executable (HTML views are exempt) and live under a trusted directory.
//! Rejected entries become human-readable warnings instead of errors.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::paths;
use crate::prompt::PromptPatterns;
use crate::relay::Answer;
use crate::sink::{Fanout, MemorySink};
use crate::supervisor::{CommandSpec, RunOutcome, Supervisor, SupervisorConfig, SupervisorError};

pub const DEFAULT_CATEGORY: &str = "Uncategorized";
pub const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);
const VERSION_MARKER: &str = "# Version:";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("script not found in catalog: {0}")]
    UnknownScript(String),
    #[error("{0} is a view, not a runnable script")]
    NotRunnable(String),
    #[error("script path is no longer a file: {}", .0.display())]
    Missing(PathBuf),
    #[error("syntax check failed for {script}:\n{output}")]
    Preflight { script: String, output: String },
    #[error("invalid backup type {0:?} (expected pihpsdr or saturn)")]
    InvalidBackupKind(String),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One `[[scripts]]` entry as written in the config file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ScriptEntry {
    /// Display name; defaults to the file name.
    #[serde(default)]
    pub name: Option<String>,
    /// Directory holding the script. A leading `~` is expanded.
    pub directory: String,
    pub filename: String,
    #[serde(default = "default_category")]
    pub category: String,
    /// Flags the script understands, offered to callers.
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

/// How a catalog file is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    Shell,
    Python,
    /// HTML page; listed but never executed.
    View,
    Executable,
}

impl ScriptKind {
    fn for_filename(filename: &str) -> Self {
        if filename.ends_with(".sh") {
            ScriptKind::Shell
        } else if filename.ends_with(".py") {
            ScriptKind::Python
        } else if filename.ends_with(".html") {
            ScriptKind::View
        } else {
            ScriptKind::Executable
        }
    }
}

/// A validated catalog entry.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogScript {
    #[serde(flatten)]
    pub entry: ScriptEntry,
    pub path: PathBuf,
    pub kind: ScriptKind,
    /// Value of a `# Version:` header line, when the script carries one.
    pub version: Option<String>,
}

impl CatalogScript {
    pub fn name(&self) -> &str {
        self.entry.name.as_deref().unwrap_or(&self.entry.filename)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Catalog {
    scripts: Vec<CatalogScript>,
    warnings: Vec<String>,
}

impl Catalog {
    /// Validate `entries` against the filesystem, resolving `~` against `home`.
    pub fn load(entries: &[ScriptEntry], home: &Path) -> Self {
        let trusted: Vec<PathBuf> = paths::trusted_dirs(home)
            .into_iter()
            .map(|dir| dir.canonicalize().unwrap_or(dir))
            .collect();

        let mut catalog = Catalog::default();
        for entry in entries {
            let path = paths::expand_home(&entry.directory, home).join(&entry.filename);
            let kind = ScriptKind::for_filename(&entry.filename);

            if !path.is_file() {
                catalog.skip(&entry.filename, "not a file");
                continue;
            }
            if kind != ScriptKind::View && !is_executable(&path) {
                catalog.skip(&entry.filename, "not executable");
                continue;
            }
            let real = path.canonicalize().unwrap_or_else(|_| path.clone());
            if !paths::is_trusted(&real, &trusted) {
                catalog.skip(&entry.filename, "outside trusted directories");
                continue;
            }

            let version = match kind {
                ScriptKind::View => None,
                _ => read_version(&path),
            };
            catalog.scripts.push(CatalogScript {
                entry: entry.clone(),
                path,
                kind,
                version,
            });
        }

        info!(
            loaded = catalog.scripts.len(),
            skipped = catalog.warnings.len(),
            "script catalog loaded"
        );
        catalog
    }

    fn skip(&mut self, filename: &str, reason: &str) {
        warn!(filename, reason, "skipping catalog entry");
        self.warnings.push(format!("Skipped {filename}: {reason}"));
    }

    pub fn scripts(&self) -> &[CatalogScript] {
        &self.scripts
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    /// Look a script up by file name or display name.
    pub fn find(&self, key: &str) -> Result<&CatalogScript, CatalogError> {
        self.scripts
            .iter()
            .find(|s| s.entry.filename == key || s.name() == key)
            .ok_or_else(|| CatalogError::UnknownScript(key.to_string()))
    }

    /// Scripts grouped by category, categories sorted by name.
    pub fn grouped(&self) -> BTreeMap<&str, Vec<&CatalogScript>> {
        let mut groups: BTreeMap<&str, Vec<&CatalogScript>> = BTreeMap::new();
        for script in &self.scripts {
            groups
                .entry(script.entry.category.as_str())
                .or_default()
                .push(script);
        }
        groups
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn read_version(path: &Path) -> Option<String> {
    let file = fs::File::open(path).ok()?;
    BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .find_map(|line| {
            line.strip_prefix(VERSION_MARKER)
                .map(|v| v.trim().to_string())
        })
}

/// The answer implied by a script's own non-interactive flags.
pub fn auto_answer_for(flags: &[String]) -> Option<Answer> {
    flags.iter().find_map(|flag| match flag.as_str() {
        "-y" => Some(Answer::Yes),
        "-n" => Some(Answer::No),
        _ => None,
    })
}

/// Builds launch commands for catalog scripts.
#[derive(Debug, Clone)]
pub struct Launcher {
    /// Interpreter inside the virtual environment, used for `.py` scripts.
    pub python: PathBuf,
    pub timeout: Duration,
    pub prompt_timeout: Duration,
}

impl Launcher {
    /// Command for running `script` with `flags`. A backup directory is passed
    /// to the script as `--backup-dir <dir>`.
    pub fn command(
        &self,
        script: &CatalogScript,
        flags: &[String],
        backup_dir: Option<&str>,
    ) -> Result<CommandSpec, CatalogError> {
        if !script.path.is_file() {
            return Err(CatalogError::Missing(script.path.clone()));
        }

        let mut args: Vec<String> = flags.to_vec();
        if let Some(dir) = backup_dir.filter(|d| !d.is_empty()) {
            args.push("--backup-dir".to_string());
            args.push(dir.to_string());
        }
        let auto_answer = auto_answer_for(&args);
        let path = script.path.to_string_lossy().into_owned();

        let spec = match script.kind {
            ScriptKind::Shell => CommandSpec::new("bash", std::iter::once(path).chain(args)),
            ScriptKind::Python => CommandSpec::new(
                self.python.to_string_lossy(),
                std::iter::once(path).chain(args),
            ),
            ScriptKind::Executable => CommandSpec::new(path, args),
            ScriptKind::View => return Err(CatalogError::NotRunnable(script.name().to_string())),
        };

        let mut spec = with_env_overlay(spec)
            .timeout(self.timeout)
            .prompt_timeout(self.prompt_timeout)
            .auto_answer(auto_answer);
        if let Some(dir) = script.path.parent() {
            spec = spec.work_dir(dir);
        }
        Ok(spec)
    }

    /// Syntax-check command, if the script kind has one.
    pub fn preflight_command(&self, script: &CatalogScript) -> Option<CommandSpec> {
        let path = script.path.to_string_lossy().into_owned();
        let spec = match script.kind {
            ScriptKind::Shell => CommandSpec::new("bash", ["-n".to_string(), path]),
            ScriptKind::Python => CommandSpec::new(
                self.python.to_string_lossy(),
                ["-m".to_string(), "py_compile".to_string(), path],
            ),
            ScriptKind::View | ScriptKind::Executable => return None,
        };
        Some(with_env_overlay(spec).timeout(PREFLIGHT_TIMEOUT))
    }

    /// Run the syntax check on a private supervisor that never waits for
    /// input. Scripts without a check pass trivially.
    pub fn preflight(&self, script: &CatalogScript) -> Result<(), CatalogError> {
        let Some(spec) = self.preflight_command(script) else {
            return Ok(());
        };
        debug!(command = %spec.display(), "running syntax check");

        let supervisor = Supervisor::new(SupervisorConfig {
            patterns: PromptPatterns::none(),
            ..SupervisorConfig::default()
        });
        let memory = MemorySink::new();
        let report = supervisor.run(spec, Fanout::default().with(memory.clone()))?;

        match report.outcome {
            RunOutcome::Completed { code: 0 } => Ok(()),
            outcome => {
                let mut output = memory.lines().join("\n");
                if output.is_empty() {
                    output = outcome.to_string();
                }
                Err(CatalogError::Preflight {
                    script: script.name().to_string(),
                    output,
                })
            }
        }
    }
}

fn with_env_overlay(spec: CommandSpec) -> CommandSpec {
    let spec = spec.env("PYTHONUNBUFFERED", "1");
    if std::env::var_os("TERM").is_none() {
        spec.env("TERM", "dumb")
    } else {
        spec
    }
}

/// Which product's backups to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Pihpsdr,
    Saturn,
}

impl BackupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupKind::Pihpsdr => "pihpsdr",
            BackupKind::Saturn => "saturn",
        }
    }
}

impl FromStr for BackupKind {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pihpsdr" => Ok(BackupKind::Pihpsdr),
            "saturn" => Ok(BackupKind::Saturn),
            other => Err(CatalogError::InvalidBackupKind(other.to_string())),
        }
    }
}

/// Names of `<home>/<kind>-backup-*` entries, newest first.
pub fn list_backups(kind: BackupKind, home: &Path) -> Result<Vec<String>, CatalogError> {
    let prefix = format!("{}-backup-", kind.as_str());
    let mut found: Vec<(SystemTime, String)> = Vec::new();

    for entry in fs::read_dir(home)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((modified, name));
    }

    found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    Ok(found.into_iter().map(|(_, name)| name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(directory: &str, filename: &str) -> ScriptEntry {
        ScriptEntry {
            name: None,
            directory: directory.to_string(),
            filename: filename.to_string(),
            category: DEFAULT_CATEGORY.to_string(),
            flags: vec!["-y".into(), "-n".into()],
            description: None,
        }
    }

    #[cfg(unix)]
    fn write_script(path: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        fs::write(path, body).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn launcher() -> Launcher {
        Launcher {
            python: PathBuf::from("/home/pi/venv/bin/python3"),
            timeout: Duration::from_secs(600),
            prompt_timeout: Duration::from_secs(600),
        }
    }

    #[cfg(unix)]
    #[test]
    fn load_validates_entries() {
        let home = tempfile::tempdir().unwrap();
        let scripts = home.path().join("github").join("Saturn");
        fs::create_dir_all(&scripts).unwrap();
        write_script(&scripts.join("update-G2.sh"), "#!/bin/bash\n# Version: 2.1\necho hi\n");
        fs::write(scripts.join("plain.sh"), "echo not executable\n").unwrap();
        fs::write(scripts.join("monitor.html"), "<html></html>").unwrap();

        let outside = tempfile::tempdir().unwrap();
        write_script(&outside.path().join("evil.sh"), "echo evil\n");

        let entries = vec![
            entry("~/github/Saturn", "update-G2.sh"),
            entry("~/github/Saturn", "plain.sh"),
            entry("~/github/Saturn", "monitor.html"),
            entry("~/github/Saturn", "missing.sh"),
            entry(&outside.path().to_string_lossy(), "evil.sh"),
        ];
        let catalog = Catalog::load(&entries, home.path());

        let names: Vec<_> = catalog.scripts().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["update-G2.sh", "monitor.html"]);
        assert_eq!(catalog.scripts()[0].version.as_deref(), Some("2.1"));
        assert_eq!(catalog.scripts()[1].kind, ScriptKind::View);
        assert_eq!(
            catalog.warnings(),
            &[
                "Skipped plain.sh: not executable".to_string(),
                "Skipped missing.sh: not a file".to_string(),
                "Skipped evil.sh: outside trusted directories".to_string(),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn command_for_shell_script_appends_backup_dir() {
        let home = tempfile::tempdir().unwrap();
        write_script(&home.path().join("update.sh"), "echo hi\n");
        let catalog = Catalog::load(&[entry("~", "update.sh")], home.path());
        let script = catalog.find("update.sh").unwrap();

        let spec = launcher()
            .command(script, &["-y".to_string()], Some("/media/usb"))
            .unwrap();
        assert_eq!(spec.program, "bash");
        assert_eq!(
            spec.args[1..],
            ["-y".to_string(), "--backup-dir".into(), "/media/usb".into()]
        );
        assert_eq!(spec.auto_answer, Some(Answer::Yes));
        assert!(spec.env.contains(&("PYTHONUNBUFFERED".into(), "1".into())));
        assert_eq!(spec.work_dir.as_deref(), Some(home.path()));
    }

    #[cfg(unix)]
    #[test]
    fn command_for_python_uses_venv_interpreter() {
        let home = tempfile::tempdir().unwrap();
        write_script(&home.path().join("tool.py"), "print('hi')\n");
        let catalog = Catalog::load(&[entry("~", "tool.py")], home.path());

        let spec = launcher()
            .command(catalog.find("tool.py").unwrap(), &[], Some(""))
            .unwrap();
        assert_eq!(spec.program, "/home/pi/venv/bin/python3");
        assert_eq!(spec.args.len(), 1);
        assert_eq!(spec.auto_answer, None);
    }

    #[test]
    fn views_are_not_runnable() {
        let home = tempfile::tempdir().unwrap();
        fs::write(home.path().join("monitor.html"), "<html></html>").unwrap();
        let catalog = Catalog::load(&[entry("~", "monitor.html")], home.path());
        let err = launcher()
            .command(catalog.find("monitor.html").unwrap(), &[], None)
            .unwrap_err();
        assert!(matches!(err, CatalogError::NotRunnable(_)));
    }

    #[test]
    fn find_unknown_script() {
        let catalog = Catalog::default();
        assert!(matches!(
            catalog.find("nope.sh"),
            Err(CatalogError::UnknownScript(_))
        ));
    }

    #[test]
    fn auto_answer_from_flags() {
        assert_eq!(auto_answer_for(&["-n".into()]), Some(Answer::No));
        assert_eq!(auto_answer_for(&["--verbose".into()]), None);
    }

    #[cfg(unix)]
    #[test]
    fn preflight_reports_syntax_errors() {
        let home = tempfile::tempdir().unwrap();
        write_script(&home.path().join("good.sh"), "echo ok\n");
        write_script(&home.path().join("bad.sh"), "if then fi (\n");
        let catalog = Catalog::load(
            &[entry("~", "good.sh"), entry("~", "bad.sh")],
            home.path(),
        );

        launcher().preflight(catalog.find("good.sh").unwrap()).unwrap();
        let err = launcher()
            .preflight(catalog.find("bad.sh").unwrap())
            .unwrap_err();
        assert!(matches!(err, CatalogError::Preflight { .. }));
    }

    #[test]
    fn backups_listed_newest_first() {
        let home = tempfile::tempdir().unwrap();
        for name in [
            "saturn-backup-20240101",
            "saturn-backup-20240301",
            "pihpsdr-backup-20240201",
            "unrelated",
        ] {
            fs::create_dir(home.path().join(name)).unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }

        let saturn = list_backups(BackupKind::Saturn, home.path()).unwrap();
        assert_eq!(saturn, vec!["saturn-backup-20240301", "saturn-backup-20240101"]);
        let pihpsdr = list_backups(BackupKind::Pihpsdr, home.path()).unwrap();
        assert_eq!(pihpsdr, vec!["pihpsdr-backup-20240201"]);
    }

    #[test]
    fn backup_kind_rejects_others() {
        assert_eq!("saturn".parse::<BackupKind>().unwrap(), BackupKind::Saturn);
        assert!(matches!(
            "../etc".parse::<BackupKind>(),
            Err(CatalogError::InvalidBackupKind(_))
        ));
    }
}
