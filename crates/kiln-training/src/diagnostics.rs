//! Environment checks reported by diagnostic invocations.

use crate::settings::JobSettings;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticCheck {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

impl DiagnosticCheck {
    fn new(name: &'static str, ok: bool, detail: impl Into<String>) -> Self {
        Self { name, ok, detail: detail.into() }
    }

    #[must_use]
    pub fn render(&self) -> String {
        format!("[{}] {}: {}", if self.ok { "ok" } else { "FAIL" }, self.name, self.detail)
    }
}

/// Probe the worker environment. `storage_backend` is the configured
/// object store id, if any.
pub fn run_diagnostics(settings: &JobSettings, storage_backend: Option<&str>) -> Vec<DiagnosticCheck> {
    let trainer = &settings.trainer;
    let mut checks = Vec::new();

    checks.push(match resolve_program(&trainer.program) {
        Some(path) => DiagnosticCheck::new("trainer_program", true, path.display().to_string()),
        None => DiagnosticCheck::new("trainer_program", false, format!("{} not found", trainer.program)),
    });

    if let Some(script) = trainer.args.first().filter(|a| a.contains('/')) {
        let exists = Path::new(script).exists();
        checks.push(DiagnosticCheck::new("trainer_script", exists, script.clone()));
    }

    checks.push(DiagnosticCheck::new(
        "module_root",
        trainer.module_root.is_dir(),
        format!("{}={}", trainer.module_path_var, trainer.module_root.display()),
    ));

    checks.push(writable_check("work_root", &settings.work_root));
    checks.push(writable_check("results_root", &settings.results_root));

    checks.push(match storage_backend {
        Some(id) => DiagnosticCheck::new(
            "storage",
            true,
            format!("{id} (source={}, results={})", settings.storage.source_bucket, settings.storage.results_bucket),
        ),
        None => DiagnosticCheck::new("storage", false, "no object store configured"),
    });

    checks.push(DiagnosticCheck::new(
        "artifact_globs",
        true,
        format!("samples={} checkpoints={}", settings.artifacts.sample_glob, settings.artifacts.checkpoint_glob),
    ));

    let deadline = trainer
        .timeout()
        .map_or_else(|| "none".to_string(), |t| format!("{}s", t.as_secs()));
    checks.push(DiagnosticCheck::new("trainer_timeout", true, deadline));

    checks
}

fn resolve_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return path.is_file().then_some(path);
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths).map(|dir| dir.join(program)).find(|candidate| candidate.is_file())
}

fn writable_check(name: &'static str, dir: &Path) -> DiagnosticCheck {
    let marker = dir.join(".kiln-write-check");
    let result = std::fs::create_dir_all(dir)
        .and_then(|()| std::fs::write(&marker, b"ok"))
        .and_then(|()| std::fs::remove_file(&marker));
    match result {
        Ok(()) => DiagnosticCheck::new(name, true, format!("{} writable", dir.display())),
        Err(e) => DiagnosticCheck::new(name, false, format!("{}: {}", dir.display(), e)),
    }
}
