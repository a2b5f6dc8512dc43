use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::diagnostic::Diagnostic;
use crate::ir::DType;
use crate::span::Site;

pub mod mma;

pub use mma::{MmaSignature, Role};

/// GPU vendor family; decides warp size defaults and matrix-atom shapes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    Nvidia,
    Amd,
}

impl Vendor {
    pub fn name(self) -> &'static str {
        match self {
            Vendor::Nvidia => "nvidia",
            Vendor::Amd => "amd",
        }
    }
}

/// Shared-memory bank geometry and capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMemory {
    /// Number of banks (32 on every supported target).
    pub banks: u32,
    /// Width of one bank word in bytes.
    pub bank_bytes: u32,
    /// Usable bytes per thread block.
    pub capacity_bytes: u64,
}

impl SharedMemory {
    /// Bytes the whole bank array serves in one conflict-free transaction.
    pub fn line_bytes(&self) -> u32 {
        self.banks * self.bank_bytes
    }
}

/// Asynchronous bulk-copy engine kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkEngine {
    /// Tensor memory accelerator: descriptor-driven tile copies.
    Tma,
    /// Per-thread asynchronous 16-byte copies.
    CpAsync,
}

impl BulkEngine {
    pub fn name(self) -> &'static str {
        match self {
            BulkEngine::Tma => "tma",
            BulkEngine::CpAsync => "cp.async",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkCopy {
    pub engine: BulkEngine,
    /// Smallest copy (bytes) worth issuing asynchronously.
    pub min_bytes: u64,
}

/// Hardware capability descriptor consumed by every pass.
///
/// Every constant the layout, scheduling and selection passes depend on
/// (bank geometry, vector width, matrix-instruction table) lives here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetCaps {
    /// Short identifier used in CLI and file paths (e.g. "sm80").
    pub name: String,
    /// Human-readable name (e.g. "NVIDIA Ampere").
    pub display_name: String,
    pub vendor: Vendor,
    /// Architecture string handed to backends (e.g. "sm_80", "gfx90a").
    pub arch: String,
    /// Threads per warp (wavefront on AMD).
    pub warp_size: u32,
    pub shared: SharedMemory,
    /// Widest single vector memory access in bytes.
    pub vector_bytes: u32,
    pub max_threads: u32,
    pub bulk_copy: Option<BulkCopy>,
    /// Matrix instructions, searched in order.
    pub mma: Vec<MmaSignature>,
}

/// Names accepted by [`TargetCaps::builtin`].
pub const BUILTIN_TARGETS: &[&str] = &["sm70", "sm80", "sm90", "gfx90a", "gfx942"];

impl TargetCaps {
    /// NVIDIA Volta: no modeled matrix instructions, synchronous copies only.
    pub fn sm70() -> Self {
        Self {
            name: "sm70".to_string(),
            display_name: "NVIDIA Volta".to_string(),
            vendor: Vendor::Nvidia,
            arch: "sm_70".to_string(),
            warp_size: 32,
            shared: SharedMemory {
                banks: 32,
                bank_bytes: 4,
                capacity_bytes: 96 * 1024,
            },
            vector_bytes: 16,
            max_threads: 1024,
            bulk_copy: None,
            mma: Vec::new(),
        }
    }

    /// NVIDIA Ampere: `mma.sync` tensor cores and `cp.async`.
    pub fn sm80() -> Self {
        Self {
            name: "sm80".to_string(),
            display_name: "NVIDIA Ampere".to_string(),
            arch: "sm_80".to_string(),
            shared: SharedMemory {
                banks: 32,
                bank_bytes: 4,
                capacity_bytes: 164 * 1024,
            },
            bulk_copy: Some(BulkCopy {
                engine: BulkEngine::CpAsync,
                min_bytes: 1024,
            }),
            mma: mma::nvidia_table(),
            ..Self::sm70()
        }
    }

    /// NVIDIA Hopper: TMA bulk copies.
    pub fn sm90() -> Self {
        Self {
            name: "sm90".to_string(),
            display_name: "NVIDIA Hopper".to_string(),
            arch: "sm_90".to_string(),
            shared: SharedMemory {
                banks: 32,
                bank_bytes: 4,
                capacity_bytes: 228 * 1024,
            },
            bulk_copy: Some(BulkCopy {
                engine: BulkEngine::Tma,
                min_bytes: 1024,
            }),
            ..Self::sm80()
        }
    }

    /// AMD CDNA2 (MI200): wave64 MFMA, 64 KiB LDS.
    pub fn gfx90a() -> Self {
        Self {
            name: "gfx90a".to_string(),
            display_name: "AMD CDNA2".to_string(),
            vendor: Vendor::Amd,
            arch: "gfx90a".to_string(),
            warp_size: 64,
            shared: SharedMemory {
                banks: 32,
                bank_bytes: 4,
                capacity_bytes: 64 * 1024,
            },
            vector_bytes: 16,
            max_threads: 1024,
            bulk_copy: None,
            mma: mma::amd_table(),
        }
    }

    /// AMD CDNA3 (MI300).
    pub fn gfx942() -> Self {
        Self {
            name: "gfx942".to_string(),
            display_name: "AMD CDNA3".to_string(),
            arch: "gfx942".to_string(),
            ..Self::gfx90a()
        }
    }

    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "sm70" => Some(Self::sm70()),
            "sm80" => Some(Self::sm80()),
            "sm90" => Some(Self::sm90()),
            "gfx90a" => Some(Self::gfx90a()),
            "gfx942" => Some(Self::gfx942()),
            _ => None,
        }
    }

    /// Natural vector width (elements) for one access of `dtype`.
    pub fn vector_elems(&self, dtype: DType) -> u32 {
        (self.vector_bytes / dtype.bytes()).max(1)
    }

    /// Look for an installed toolkit and pick a matching preset.
    pub fn detect() -> Result<Self, Diagnostic> {
        let env_dir = |var: &str| std::env::var_os(var).filter(|v| !v.is_empty());
        if env_dir("CUDA_HOME").is_some()
            || env_dir("CUDA_PATH").is_some()
            || Path::new("/usr/local/cuda").exists()
        {
            tracing::debug!("auto target: found CUDA toolkit");
            return Ok(Self::sm80());
        }
        if env_dir("ROCM_PATH").is_some() || Path::new("/opt/rocm").exists() {
            tracing::debug!("auto target: found ROCm");
            return Ok(Self::gfx90a());
        }
        Err(Diagnostic::error(
            "cannot detect a GPU toolkit for target 'auto'".to_string(),
            Site::Nowhere,
        )
        .with_help(format!(
            "pass an explicit target: {}",
            BUILTIN_TARGETS.join(", ")
        )))
    }

    /// Load a target descriptor from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Diagnostic> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Diagnostic::error(
                format!("cannot read target descriptor '{}': {}", path.display(), e),
                Site::Nowhere,
            )
        })?;
        Self::parse_toml(&content, path)
    }

    /// Resolve a target by name: `auto`, a built-in preset, or
    /// `targets/{name}.toml` relative to the binary or working directory.
    pub fn resolve(name: &str) -> Result<Self, Diagnostic> {
        // Reject path traversal
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
            || name.starts_with('.')
        {
            return Err(Diagnostic::error(
                format!("invalid target name '{}'", name),
                Site::Nowhere,
            ));
        }

        if name == "auto" {
            return Self::detect();
        }
        if let Some(caps) = Self::builtin(name) {
            return Ok(caps);
        }

        let relative = format!("targets/{}.toml", name);

        // 1. Relative to the binary and its two parents
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let candidates = [
                    Some(dir.to_path_buf()),
                    dir.parent().map(|p| p.to_path_buf()),
                    dir.parent().and_then(|p| p.parent()).map(|p| p.to_path_buf()),
                ];
                for base in candidates.iter().flatten() {
                    let path = base.join(&relative);
                    if path.exists() {
                        return Self::load(&path);
                    }
                }
            }
        }

        // 2. Current working directory
        let cwd_path = std::path::PathBuf::from(&relative);
        if cwd_path.exists() {
            return Self::load(&cwd_path);
        }

        Err(Diagnostic::error(
            format!("unknown target '{}' (looked for '{}')", name, relative),
            Site::Nowhere,
        )
        .with_help(format!("available targets: auto, {}", BUILTIN_TARGETS.join(", "))))
    }

    fn parse_toml(content: &str, path: &Path) -> Result<Self, Diagnostic> {
        let err =
            |msg: String| Diagnostic::error(format!("{}: {}", path.display(), msg), Site::Nowhere);

        let mut name = String::new();
        let mut display_name = String::new();
        let mut vendor = String::new();
        let mut arch = String::new();
        let mut warp_size: u32 = 0;
        let mut vector_bytes: u32 = 16;
        let mut max_threads: u32 = 1024;
        let mut banks: u32 = 32;
        let mut bank_bytes: u32 = 4;
        let mut capacity_bytes: u64 = 0;
        let mut bulk_engine = String::new();
        let mut bulk_min_bytes: u64 = 1024;
        let mut mma_entries: Vec<MmaEntry> = Vec::new();

        let mut section = String::new();

        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                section = trimmed[1..trimmed.len() - 1].trim().to_string();
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            let unquoted = value.trim_matches('"');
            let num = |what: &str| -> Result<u64, Diagnostic> {
                value
                    .parse()
                    .map_err(|_| err(format!("invalid {}.{}: {}", what, key, value)))
            };

            match (section.as_str(), key) {
                ("target", "name") => name = unquoted.to_string(),
                ("target", "display_name") => display_name = unquoted.to_string(),
                ("target", "vendor") => vendor = unquoted.to_string(),
                ("target", "arch") => arch = unquoted.to_string(),
                ("target", "warp_size") => warp_size = num("target")? as u32,
                ("target", "vector_bytes") => vector_bytes = num("target")? as u32,
                ("target", "max_threads") => max_threads = num("target")? as u32,
                ("shared_memory", "banks") => banks = num("shared_memory")? as u32,
                ("shared_memory", "bank_bytes") => bank_bytes = num("shared_memory")? as u32,
                ("shared_memory", "capacity_bytes") => capacity_bytes = num("shared_memory")?,
                ("bulk_copy", "engine") => bulk_engine = unquoted.to_string(),
                ("bulk_copy", "min_bytes") => bulk_min_bytes = num("bulk_copy")?,
                _ => {
                    // [mma.NAME] sections
                    if let Some(mma_name) = section.strip_prefix("mma.") {
                        let entry = match mma_entries.iter().position(|e| e.name == mma_name) {
                            Some(i) => &mut mma_entries[i],
                            None => {
                                mma_entries.push(MmaEntry::new(mma_name));
                                let last = mma_entries.len() - 1;
                                &mut mma_entries[last]
                            }
                        };
                        match key {
                            "shape" => {
                                let dims = parse_u32_array(value);
                                if dims.len() != 3 {
                                    return Err(err(format!(
                                        "mma.{}.shape must have three entries: {}",
                                        mma_name, value
                                    )));
                                }
                                entry.shape = [dims[0], dims[1], dims[2]];
                            }
                            "a" | "b" | "acc" => {
                                let dtype: DType = unquoted.parse().map_err(|e: String| {
                                    err(format!("mma.{}.{}: {}", mma_name, key, e))
                                })?;
                                match key {
                                    "a" => entry.a = Some(dtype),
                                    "b" => entry.b = Some(dtype),
                                    _ => entry.acc = Some(dtype),
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        if name.is_empty() {
            return Err(err("missing target.name".to_string()));
        }
        let vendor = match vendor.as_str() {
            "nvidia" => Vendor::Nvidia,
            "amd" => Vendor::Amd,
            other => {
                return Err(err(format!(
                    "unknown vendor '{}' (expected 'nvidia' or 'amd')",
                    other
                )))
            }
        };
        if warp_size == 0 {
            warp_size = match vendor {
                Vendor::Nvidia => 32,
                Vendor::Amd => 64,
            };
        }
        if banks == 0 || bank_bytes == 0 {
            return Err(err("shared_memory.banks and bank_bytes must be > 0".to_string()));
        }
        if capacity_bytes == 0 {
            return Err(err("shared_memory.capacity_bytes must be > 0".to_string()));
        }
        if vector_bytes == 0 {
            return Err(err("target.vector_bytes must be > 0".to_string()));
        }
        let bulk_copy = match bulk_engine.as_str() {
            "" | "none" => None,
            "tma" => Some(BulkCopy {
                engine: BulkEngine::Tma,
                min_bytes: bulk_min_bytes,
            }),
            "cp.async" | "cp_async" => Some(BulkCopy {
                engine: BulkEngine::CpAsync,
                min_bytes: bulk_min_bytes,
            }),
            other => {
                return Err(err(format!(
                    "unknown bulk_copy.engine '{}' (expected 'tma', 'cp.async' or 'none')",
                    other
                )))
            }
        };

        let mut mma = Vec::with_capacity(mma_entries.len());
        for entry in mma_entries {
            let sig = entry
                .finish(vendor, warp_size)
                .map_err(|msg| err(msg))?;
            mma.push(sig);
        }

        if display_name.is_empty() {
            display_name = name.clone();
        }
        if arch.is_empty() {
            arch = name.clone();
        }

        Ok(Self {
            name,
            display_name,
            vendor,
            arch,
            warp_size,
            shared: SharedMemory {
                banks,
                bank_bytes,
                capacity_bytes,
            },
            vector_bytes,
            max_threads,
            bulk_copy,
            mma,
        })
    }
}

/// A `[mma.NAME]` section being parsed.
struct MmaEntry {
    name: String,
    shape: [u32; 3],
    a: Option<DType>,
    b: Option<DType>,
    acc: Option<DType>,
}

impl MmaEntry {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            shape: [0; 3],
            a: None,
            b: None,
            acc: None,
        }
    }

    fn finish(self, vendor: Vendor, warp_size: u32) -> Result<MmaSignature, String> {
        let (Some(a), Some(b), Some(acc)) = (self.a, self.b, self.acc) else {
            return Err(format!("mma.{} needs a, b and acc element types", self.name));
        };
        let sig = MmaSignature {
            name: self.name,
            vendor,
            shape: self.shape,
            a,
            b,
            acc,
            warp_size,
        };
        sig.validate()?;
        Ok(sig)
    }
}

fn parse_u32_array(value: &str) -> Vec<u32> {
    value
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect()
}
