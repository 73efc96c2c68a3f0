//! Compiler options.
//!
//! Most knobs arrive from the driver's command line; a project can also
//! keep defaults in a `cvm.toml` loaded here and merged under the explicit
//! flags.

use cvm_core::flags::SanitizerFlags;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Options {
    pub include_paths: Vec<PathBuf>,
    /// `-D NAME[=VALUE]` style predefines.
    pub defines: Vec<(String, String)>,
    /// `-U NAME` style undefines, applied after the predefines.
    pub undefines: Vec<String>,
    pub sanitizers: SanitizerFlags,
    /// Report every independent parse/type error instead of stopping at
    /// the first one.
    pub collect_errors: bool,
    /// Build a source map and keep symbol information for the runtime.
    pub enable_debugger: bool,
    /// Run the peephole pass over generated code.
    pub optimize: bool,
    pub ffi_allow: Vec<String>,
    pub ffi_deny: Vec<String>,
    pub disable_ffi: bool,
    /// Denied foreign calls abort instead of warning.
    pub ffi_fatal: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            include_paths: Vec::new(),
            defines: Vec::new(),
            undefines: Vec::new(),
            sanitizers: SanitizerFlags::none(),
            collect_errors: true,
            enable_debugger: false,
            optimize: true,
            ffi_allow: Vec::new(),
            ffi_deny: Vec::new(),
            disable_ffi: false,
            ffi_fatal: true,
        }
    }
}

/// On-disk project configuration (`cvm.toml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub include_paths: Vec<PathBuf>,
    #[serde(default)]
    pub defines: Vec<String>,
    #[serde(default)]
    pub sanitizers: SanitizerSection,
    #[serde(default)]
    pub ffi: FfiSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SanitizerSection {
    #[serde(default)]
    pub stack_canaries: bool,
    #[serde(default)]
    pub heap_canaries: bool,
    #[serde(default)]
    pub bounds_checks: bool,
    #[serde(default)]
    pub cfi: bool,
    #[serde(default)]
    pub memory_tagging: bool,
    #[serde(default)]
    pub overflow_checks: bool,
    #[serde(default)]
    pub uninit_detection: bool,
    #[serde(default)]
    pub uaf_detection: bool,
    #[serde(default)]
    pub leak_detection: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FfiSection {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub disable: bool,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("{}: {}", path.display(), e))?;
        toml::from_str(&text).map_err(|e| format!("{}: {}", path.display(), e))
    }

    /// Fold the file's defaults into `options`; explicit flags win.
    pub fn apply(&self, options: &mut Options) {
        for p in &self.include_paths {
            if !options.include_paths.contains(p) {
                options.include_paths.push(p.clone());
            }
        }
        for d in &self.defines {
            let (name, val) = match d.split_once('=') {
                Some((n, v)) => (n.to_string(), v.to_string()),
                None => (d.clone(), "1".to_string()),
            };
            options.defines.push((name, val));
        }
        let s = &self.sanitizers;
        let f = &mut options.sanitizers;
        f.stack_canaries |= s.stack_canaries;
        f.heap_canaries |= s.heap_canaries;
        f.bounds_checks |= s.bounds_checks;
        f.cfi |= s.cfi;
        f.memory_tagging |= s.memory_tagging;
        f.overflow_checks |= s.overflow_checks;
        f.uninit_detection |= s.uninit_detection;
        f.uaf_detection |= s.uaf_detection;
        f.leak_detection |= s.leak_detection;
        options.ffi_allow.extend(self.ffi.allow.iter().cloned());
        options.ffi_deny.extend(self.ffi.deny.iter().cloned());
        options.disable_ffi |= self.ffi.disable;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_parses_and_applies() {
        let text = r#"
            include_paths = ["vendor/include"]
            defines = ["DEBUG", "MAX=16"]

            [sanitizers]
            stack_canaries = true
            bounds_checks = true

            [ffi]
            deny = ["system"]
        "#;
        let cfg: ConfigFile = toml::from_str(text).unwrap();
        let mut opts = Options::default();
        cfg.apply(&mut opts);
        assert!(opts.sanitizers.stack_canaries);
        assert!(opts.sanitizers.bounds_checks);
        assert!(!opts.sanitizers.cfi);
        assert_eq!(opts.defines[0], ("DEBUG".into(), "1".into()));
        assert_eq!(opts.defines[1], ("MAX".into(), "16".into()));
        assert_eq!(opts.ffi_deny, vec!["system".to_string()]);
        assert_eq!(opts.include_paths, vec![PathBuf::from("vendor/include")]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = "mystery = true\n";
        assert!(toml::from_str::<ConfigFile>(text).is_err());
    }
}
