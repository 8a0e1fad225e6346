//! CPU capability detection
//!
//! Picks the most capable precompiled runtime build the host CPU can run. The
//! selection itself is a pure function over the reported feature string; the
//! host is inspected once per process.

use once_cell::sync::Lazy;

/// Precompiled runtime builds, most featured first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeVariant {
    V84Fp16DotprodI8mmSve,
    V84Fp16DotprodSve,
    V84Fp16DotprodI8mm,
    V84Fp16Dotprod,
    V82Fp16Dotprod,
    V82Fp16,
    V8,
    V7a,
    /// Generic build with no ARM specific instructions
    Default,
}

impl RuntimeVariant {
    /// Name of the native library built for this variant
    pub fn library_name(self) -> &'static str {
        match self {
            RuntimeVariant::V84Fp16DotprodI8mmSve => "smollm_v8_4_fp16_dotprod_i8mm_sve",
            RuntimeVariant::V84Fp16DotprodSve => "smollm_v8_4_fp16_dotprod_sve",
            RuntimeVariant::V84Fp16DotprodI8mm => "smollm_v8_4_fp16_dotprod_i8mm",
            RuntimeVariant::V84Fp16Dotprod => "smollm_v8_4_fp16_dotprod",
            RuntimeVariant::V82Fp16Dotprod => "smollm_v8_2_fp16_dotprod",
            RuntimeVariant::V82Fp16 => "smollm_v8_2_fp16",
            RuntimeVariant::V8 => "smollm_v8",
            RuntimeVariant::V7a => "smollm_v7a",
            RuntimeVariant::Default => "smollm",
        }
    }
}

impl std::fmt::Display for RuntimeVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.library_name())
    }
}

/// Capability flags parsed from an OS feature string
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuFeatures {
    pub fp16: bool,
    pub dotprod: bool,
    pub sve: bool,
    pub i8mm: bool,
    /// asimd + crc32 + aes
    pub armv8_2: bool,
    /// dcpop + uscat
    pub armv8_4: bool,
}

impl CpuFeatures {
    /// Parses a whitespace separated feature list such as the `Features` line of `/proc/cpuinfo`
    pub fn parse(features: &str) -> Self {
        let flags: Vec<&str> = features.split_whitespace().collect();
        let has = |name: &str| flags.contains(&name);

        Self {
            fp16: has("fp16") || has("fphp"),
            dotprod: has("dotprod") || has("asimddp"),
            sve: has("sve"),
            i8mm: has("i8mm"),
            armv8_2: has("asimd") && has("crc32") && has("aes"),
            armv8_4: has("dcpop") && has("uscat"),
        }
    }
}

/// Chooses the runtime build for a CPU.
///
/// `abis` lists the supported instruction set ABIs, preferred first. Emulated
/// hosts always get [`RuntimeVariant::Default`] since their feature strings are
/// unreliable.
pub fn select_runtime_variant(features: &str, abis: &[&str], is_emulated: bool) -> RuntimeVariant {
    if is_emulated {
        return RuntimeVariant::Default;
    }

    if abis.contains(&"arm64-v8a") {
        let f = CpuFeatures::parse(features);
        let fp16_dotprod = f.fp16 && f.dotprod;
        return if f.armv8_4 && f.sve && f.i8mm && fp16_dotprod {
            RuntimeVariant::V84Fp16DotprodI8mmSve
        } else if f.armv8_4 && f.sve && fp16_dotprod {
            RuntimeVariant::V84Fp16DotprodSve
        } else if f.armv8_4 && f.i8mm && fp16_dotprod {
            RuntimeVariant::V84Fp16DotprodI8mm
        } else if f.armv8_4 && fp16_dotprod {
            RuntimeVariant::V84Fp16Dotprod
        } else if f.armv8_2 && fp16_dotprod {
            RuntimeVariant::V82Fp16Dotprod
        } else if f.armv8_2 && f.fp16 {
            RuntimeVariant::V82Fp16
        } else {
            RuntimeVariant::V8
        };
    }

    if abis.first() == Some(&"armeabi-v7a") {
        return RuntimeVariant::V7a;
    }

    RuntimeVariant::Default
}

/// Extracts the feature list from `/proc/cpuinfo` contents
pub fn cpuinfo_features(cpuinfo: &str) -> Option<&str> {
    cpuinfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "Features").then(|| value.trim())
    })
}

fn cpuinfo_hardware(cpuinfo: &str) -> Option<&str> {
    cpuinfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == "Hardware").then(|| value.trim())
    })
}

/// True for hardware names reported by Android emulators
pub fn is_emulated_hardware(hardware: &str) -> bool {
    hardware.contains("goldfish") || hardware.contains("ranchu")
}

fn host_abis() -> &'static [&'static str] {
    match std::env::consts::ARCH {
        "aarch64" => &["arm64-v8a"],
        "arm" => &["armeabi-v7a"],
        "x86_64" => &["x86_64"],
        "x86" => &["x86"],
        _ => &[],
    }
}

static SELECTED: Lazy<RuntimeVariant> = Lazy::new(|| {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
    let features = cpuinfo_features(&cpuinfo).unwrap_or_default();
    let is_emulated = cpuinfo_hardware(&cpuinfo).is_some_and(is_emulated_hardware);

    tracing::debug!("CPU features: {:?} (emulated: {})", CpuFeatures::parse(features), is_emulated);
    let variant = select_runtime_variant(features, host_abis(), is_emulated);
    tracing::info!("Selected runtime variant {}", variant);
    variant
});

/// Runtime build for this host. Computed on first call and fixed for the process lifetime.
pub fn runtime_variant() -> RuntimeVariant {
    *SELECTED
}
