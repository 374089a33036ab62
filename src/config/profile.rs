//! Machine profile injected at startup.

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Linux,
    MacAppleSilicon,
    LinuxWsl,
    WindowsNative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuKind {
    #[default]
    None,
    Cuda,
    Metal,
}

/// Hardware and filesystem facts for the running process.
///
/// Produced by an external detection step and fixed for the process
/// lifetime; the router keeps a single shared copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub platform: Platform,
    #[serde(default)]
    pub gpu_kind: GpuKind,
    #[serde(default)]
    pub vram_bytes: u64,
    #[serde(default = "default_cpu_threads")]
    pub cpu_threads: u32,
    pub models_root: PathBuf,
}

fn default_cpu_threads() -> u32 {
    4
}

impl HardwareProfile {
    pub fn new(platform: Platform, models_root: impl Into<PathBuf>) -> Self {
        Self {
            platform,
            gpu_kind: GpuKind::None,
            vram_bytes: 0,
            cpu_threads: default_cpu_threads(),
            models_root: models_root.into(),
        }
    }

    pub fn with_gpu(mut self, gpu_kind: GpuKind, vram_bytes: u64) -> Self {
        self.gpu_kind = gpu_kind;
        self.vram_bytes = vram_bytes;
        self
    }

    pub fn with_cpu_threads(mut self, threads: u32) -> Self {
        self.cpu_threads = threads;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.cpu_threads == 0 {
            return Err(Error::configuration_with_context(
                "cpu_threads must be at least 1",
                ErrorContext::new().with_field_path("profile.cpu_threads"),
            ));
        }
        let gpu_ok = match self.gpu_kind {
            GpuKind::None => true,
            GpuKind::Metal => self.platform == Platform::MacAppleSilicon,
            GpuKind::Cuda => self.platform != Platform::MacAppleSilicon,
        };
        if !gpu_ok {
            return Err(Error::configuration_with_context(
                format!("gpu_kind {:?} is not available on {:?}", self.gpu_kind, self.platform),
                ErrorContext::new().with_field_path("profile.gpu_kind"),
            ));
        }
        Ok(())
    }

    /// Resolve a model location to a path on this host.
    ///
    /// Relative locations join `models_root`. On WSL, Windows drive paths
    /// (`C:\models\x.gguf`) map to their `/mnt/<drive>` mount.
    pub fn resolve_location(&self, location: &str) -> PathBuf {
        let translated = match self.platform {
            Platform::LinuxWsl => windows_to_wsl(location).unwrap_or_else(|| location.to_string()),
            _ => location.to_string(),
        };
        let path = Path::new(&translated);
        if path.is_absolute() || looks_like_windows_absolute(&translated) {
            path.to_path_buf()
        } else {
            self.models_root.join(path)
        }
    }

    /// Whether GPU offload should be requested from local backends.
    pub fn gpu_offload(&self) -> bool {
        self.gpu_kind != GpuKind::None && self.vram_bytes > 0
    }
}

fn looks_like_windows_absolute(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 3 && b[0].is_ascii_alphabetic() && b[1] == b':' && (b[2] == b'\\' || b[2] == b'/')
}

/// `C:\models\a.gguf` -> `/mnt/c/models/a.gguf`
pub fn windows_to_wsl(path: &str) -> Option<String> {
    if !looks_like_windows_absolute(path) {
        return None;
    }
    let drive = path[..1].to_ascii_lowercase();
    let rest = path[3..].replace('\\', "/");
    Some(format!("/mnt/{}/{}", drive, rest))
}

/// `/mnt/c/models/a.gguf` -> `C:\models\a.gguf`, for Windows binaries launched from WSL.
pub fn wsl_to_windows(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/mnt/")?;
    let mut parts = rest.splitn(2, '/');
    let drive = parts.next()?;
    if drive.len() != 1 || !drive.as_bytes()[0].is_ascii_alphabetic() {
        return None;
    }
    let tail = parts.next().unwrap_or("").replace('/', "\\");
    Some(format!("{}:\\{}", drive.to_ascii_uppercase(), tail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_locations_join_models_root() {
        let profile = HardwareProfile::new(Platform::Linux, "/srv/models");
        assert_eq!(
            profile.resolve_location("llama/q4.gguf"),
            PathBuf::from("/srv/models/llama/q4.gguf")
        );
        assert_eq!(
            profile.resolve_location("/opt/m.gguf"),
            PathBuf::from("/opt/m.gguf")
        );
    }

    #[test]
    fn test_wsl_translation_both_ways() {
        assert_eq!(
            windows_to_wsl(r"D:\models\m.gguf").as_deref(),
            Some("/mnt/d/models/m.gguf")
        );
        assert_eq!(
            wsl_to_windows("/mnt/d/models/m.gguf").as_deref(),
            Some(r"D:\models\m.gguf")
        );
        assert_eq!(wsl_to_windows("/home/u/m.gguf"), None);

        let profile = HardwareProfile::new(Platform::LinuxWsl, "/srv/models");
        assert_eq!(
            profile.resolve_location(r"C:\w\m.gguf"),
            PathBuf::from("/mnt/c/w/m.gguf")
        );
    }

    #[test]
    fn test_metal_requires_apple_silicon() {
        let bad = HardwareProfile::new(Platform::Linux, "/m").with_gpu(GpuKind::Metal, 1);
        assert!(bad.validate().is_err());
        let ok = HardwareProfile::new(Platform::MacAppleSilicon, "/m").with_gpu(GpuKind::Metal, 1);
        assert!(ok.validate().is_ok());
    }
}
