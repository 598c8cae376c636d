use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, ensure};
use settings_model::FillMode;
use tracing::{debug, info, warn};

use crate::config::DisplayConfig;

/// Captured result of one shell command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Executes a shell command line; swapped out in tests.
pub type CommandRunner = Arc<dyn Fn(&str) -> Result<CommandOutput> + Send + Sync>;

/// An enabled output and its current mode, when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInfo {
    pub name: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl DisplayInfo {
    pub fn largest_side(&self) -> Option<u32> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some(w.max(h)),
            (w, h) => w.or(h),
        }
    }
}

/// Where wallpapers end up.
pub trait DisplaySurface: Send + Sync {
    fn displays(&self) -> Result<Vec<DisplayInfo>>;

    /// Applies `path` to every display; returns how many accepted it.
    fn apply(&self, path: &Path, mode: FillMode) -> Result<usize>;

    /// Files most recently applied by this surface, one per output.
    fn active_wallpapers(&self) -> Vec<PathBuf>;

    /// Largest side across attached displays.
    fn recommended_max_dimension(&self) -> Option<u32> {
        self.displays()
            .ok()?
            .iter()
            .filter_map(DisplayInfo::largest_side)
            .max()
    }
}

/// Drives a compositor through shell commands.
#[derive(Clone)]
pub struct CommandDisplaySurface {
    inner: Arc<SurfaceInner>,
}

struct SurfaceInner {
    detect_command: Option<String>,
    apply_command: String,
    fallback_output: String,
    runner: CommandRunner,
    applied: Mutex<BTreeMap<String, PathBuf>>,
}

impl CommandDisplaySurface {
    pub fn new(config: &DisplayConfig) -> Result<Self> {
        Self::with_runner(config, Arc::new(run_shell))
    }

    pub fn with_runner(config: &DisplayConfig, runner: CommandRunner) -> Result<Self> {
        ensure_not_blank(&config.apply_command, "apply command")?;
        if let Some(cmd) = config.detect_command.as_deref() {
            ensure_not_blank(cmd, "detect command")?;
        }
        ensure!(
            config.apply_command.contains("@FILE@"),
            "apply command must contain @FILE@"
        );
        Ok(Self {
            inner: Arc::new(SurfaceInner {
                detect_command: config.detect_command.clone(),
                apply_command: config.apply_command.clone(),
                fallback_output: config.fallback_output.clone(),
                runner,
                applied: Mutex::new(BTreeMap::new()),
            }),
        })
    }
}

impl DisplaySurface for CommandDisplaySurface {
    fn displays(&self) -> Result<Vec<DisplayInfo>> {
        let Some(command) = self.inner.detect_command.as_deref() else {
            return Ok(Vec::new());
        };
        let output = (self.inner.runner)(command)?;
        if !output.success {
            return Err(anyhow!(
                "display detection exited with status {}: {command}",
                output.code.unwrap_or(-1)
            ));
        }
        Ok(parse_wlr_randr(&output.stdout))
    }

    fn apply(&self, path: &Path, mode: FillMode) -> Result<usize> {
        let outputs = match self.displays() {
            Ok(displays) if !displays.is_empty() => {
                displays.into_iter().map(|d| d.name).collect::<Vec<_>>()
            }
            Ok(_) => vec![self.inner.fallback_output.clone()],
            Err(err) => {
                warn!(error = %err, "display detection failed; using fallback output");
                vec![self.inner.fallback_output.clone()]
            }
        };
        self.inner.apply_all(&outputs, path, mode)
    }

    fn active_wallpapers(&self) -> Vec<PathBuf> {
        match self.inner.applied.lock() {
            Ok(applied) => applied.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        }
    }
}

impl SurfaceInner {
    fn apply_all(&self, outputs: &[String], path: &Path, mode: FillMode) -> Result<usize> {
        let mut errors = Vec::new();
        let mut applied = 0usize;

        for output in outputs {
            let command = render_command(&self.apply_command, output, path, mode);
            debug!(%output, %command, "applying wallpaper");
            match self.run_checked(&command) {
                Ok(()) => {
                    applied += 1;
                    self.remember(output, path);
                }
                Err(err) => {
                    warn!(%output, error = %err, "output rejected wallpaper");
                    errors.push(format!("{output}: {err}"));
                }
            }
        }

        match errors.len() {
            0 => {
                info!(path = %path.display(), displays = applied, "wallpaper applied");
                Ok(applied)
            }
            failed => Err(anyhow!(
                "{failed} of {} display(s) failed; first: {}",
                outputs.len(),
                errors[0]
            )),
        }
    }

    fn run_checked(&self, command: &str) -> Result<()> {
        let output = (self.runner)(command)?;
        if output.success {
            return Ok(());
        }
        let stderr = output.stderr.trim();
        Err(anyhow!(
            "command exited with status {}{}{}",
            output.code.unwrap_or(-1),
            if stderr.is_empty() { "" } else { ": " },
            stderr
        ))
    }

    fn remember(&self, output: &str, path: &Path) {
        let mut applied = match self.applied.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        applied.insert(output.to_string(), path.to_path_buf());
    }
}

fn run_shell(command: &str) -> Result<CommandOutput> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .with_context(|| format!("failed to spawn shell for command: {command}"))?;
    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn render_command(template: &str, output: &str, path: &Path, mode: FillMode) -> String {
    template
        .replace("@OUTPUT@", &shell_quote(output))
        .replace("@FILE@", &shell_quote(&path.to_string_lossy()))
        .replace("@MODE@", mode.as_str())
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Parses `wlr-randr` output: unindented output headers, indented properties.
fn parse_wlr_randr(text: &str) -> Vec<DisplayInfo> {
    let mut displays = Vec::new();
    let mut current: Option<(DisplayInfo, bool)> = None;

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            if let Some((info, enabled)) = current.take() {
                if enabled {
                    displays.push(info);
                }
            }
            let name = line.split_whitespace().next().unwrap_or_default();
            current = Some((
                DisplayInfo {
                    name: name.to_string(),
                    width: None,
                    height: None,
                },
                true,
            ));
            continue;
        }
        let Some((info, enabled)) = current.as_mut() else {
            continue;
        };
        let trimmed = line.trim();
        if let Some(value) = trimmed.strip_prefix("Enabled:") {
            *enabled = value.trim() == "yes";
        } else if trimmed.contains("current") {
            if let Some((w, h)) = parse_mode(trimmed) {
                info.width = Some(w);
                info.height = Some(h);
            }
        }
    }
    if let Some((info, enabled)) = current {
        if enabled {
            displays.push(info);
        }
    }
    displays
}

fn parse_mode(line: &str) -> Option<(u32, u32)> {
    let size = line.split_whitespace().next()?;
    let (w, h) = size.split_once('x')?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

fn ensure_not_blank(value: &str, label: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(anyhow!("{label} must not be blank"))
    } else {
        Ok(())
    }
}
