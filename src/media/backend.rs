//! Decoder Backend Selection
//!
//! Maps platform, GPU vendor, codec and user preference to an ordered list
//! of decoder backends. The head of the list is opened first; the rest are
//! fallbacks used when a backend faults mid-session.

use log::{debug, info, warn};
use std::collections::HashSet;
use std::fmt;

use crate::app::{VideoCodec, VideoDecoderBackend};

/// GPU Vendor for decoder optimization
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum GpuVendor {
    Nvidia,
    Intel,
    Amd,
    Apple,
    Broadcom, // Raspberry Pi VideoCore
    Other,
    Unknown,
}

impl GpuVendor {
    /// Classify an adapter by its reported name
    pub fn from_adapter_name(name: &str) -> Self {
        let name = name.to_lowercase();
        if name.contains("nvidia") || name.contains("geforce") || name.contains("quadro") {
            GpuVendor::Nvidia
        } else if name.contains("amd") || name.contains("adeon") || name.contains("ryzen") {
            GpuVendor::Amd
        } else if name.contains("intel")
            || name.contains("uhd")
            || name.contains("iris")
            || name.contains("arc")
        {
            GpuVendor::Intel
        } else if name.contains("apple")
            || name.contains("m1")
            || name.contains("m2")
            || name.contains("m3")
        {
            GpuVendor::Apple
        } else if name.contains("videocore")
            || name.contains("broadcom")
            || name.contains("v3d")
            || name.contains("vc4")
        {
            GpuVendor::Broadcom
        } else {
            GpuVendor::Other
        }
    }

    /// Classify by PCI vendor id
    pub fn from_pci_id(id: u32) -> Self {
        match id {
            0x10de => GpuVendor::Nvidia,
            0x8086 => GpuVendor::Intel,
            0x1002 | 0x1022 => GpuVendor::Amd,
            0x106b => GpuVendor::Apple,
            0x14e4 => GpuVendor::Broadcom,
            _ => GpuVendor::Other,
        }
    }

    fn score(&self) -> i32 {
        match self {
            GpuVendor::Nvidia => 100,
            GpuVendor::Apple => 90, // Apple Silicon is high perf
            GpuVendor::Amd => 80,
            GpuVendor::Intel => 50,
            GpuVendor::Broadcom => 30, // Raspberry Pi - low power device
            GpuVendor::Other | GpuVendor::Unknown => 0,
        }
    }
}

/// Operating system family the selector tables are keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Windows,
    MacOS,
    Linux,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOS
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Other
        }
    }
}

/// Result of the GPU probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuInfo {
    pub vendor: GpuVendor,
    pub name: String,
    pub discrete: bool,
}

impl GpuInfo {
    pub fn unknown() -> Self {
        Self {
            vendor: GpuVendor::Unknown,
            name: String::new(),
            discrete: false,
        }
    }

    fn score(&self) -> i32 {
        self.vendor.score() + if self.discrete { 50 } else { 10 }
    }
}

/// Pick the adapter decode work should run on, prioritizing discrete GPUs
pub fn pick_best_adapter(adapters: impl IntoIterator<Item = GpuInfo>) -> Option<GpuInfo> {
    let mut best: Option<GpuInfo> = None;
    for adapter in adapters {
        info!(
            "  - {} (discrete: {}, Vendor: {:?}, Score: {})",
            adapter.name,
            adapter.discrete,
            adapter.vendor,
            adapter.score()
        );
        if best.as_ref().is_none_or(|b| adapter.score() > b.score()) {
            best = Some(adapter);
        }
    }
    best
}

/// Cached GPU probe
static GPU_INFO: std::sync::OnceLock<GpuInfo> = std::sync::OnceLock::new();

/// Detect the primary GPU
pub fn detect_gpu() -> GpuInfo {
    GPU_INFO
        .get_or_init(|| {
            info!("Available GPU adapters:");
            let adapters = enumerate_adapters();
            match pick_best_adapter(adapters) {
                Some(gpu) => {
                    info!("Selected best GPU vendor: {:?} ({})", gpu.vendor, gpu.name);
                    gpu
                }
                None => {
                    warn!("GPU probe found no adapters, using generic backend order");
                    GpuInfo::unknown()
                }
            }
        })
        .clone()
}

/// Detect the primary GPU vendor
pub fn detect_gpu_vendor() -> GpuVendor {
    detect_gpu().vendor
}

fn enumerate_adapters() -> Vec<GpuInfo> {
    #[cfg(feature = "gpu-probe")]
    {
        let adapters = enumerate_wgpu_adapters();
        if !adapters.is_empty() {
            return adapters;
        }
    }

    #[cfg(target_os = "linux")]
    {
        return enumerate_sysfs_adapters();
    }

    #[allow(unreachable_code)]
    Vec::new()
}

#[cfg(feature = "gpu-probe")]
fn enumerate_wgpu_adapters() -> Vec<GpuInfo> {
    // wgpu adapter enumeration is async; the probe runs once from sync context
    pollster::block_on(async {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapters = instance.enumerate_adapters(wgpu::Backends::all()).await;

        adapters
            .into_iter()
            .map(|adapter| {
                let info = adapter.get_info();
                GpuInfo {
                    vendor: GpuVendor::from_adapter_name(&info.name),
                    discrete: info.device_type == wgpu::DeviceType::DiscreteGpu,
                    name: info.name,
                }
            })
            .collect()
    })
}

/// DRM cards expose the PCI vendor id under /sys/class/drm/cardN/device/vendor
#[cfg(target_os = "linux")]
fn enumerate_sysfs_adapters() -> Vec<GpuInfo> {
    let Ok(entries) = std::fs::read_dir("/sys/class/drm") else {
        return Vec::new();
    };

    let mut adapters = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("card") || name.contains('-') {
            continue;
        }
        let device = entry.path().join("device");
        let vendor = std::fs::read_to_string(device.join("vendor"))
            .ok()
            .and_then(|v| u32::from_str_radix(v.trim().trim_start_matches("0x"), 16).ok())
            .map(GpuVendor::from_pci_id);

        // Platform devices (Pi VideoCore) have no PCI vendor file
        let vendor = vendor.unwrap_or_else(|| {
            std::fs::read_to_string(device.join("uevent"))
                .map(|u| GpuVendor::from_adapter_name(&u))
                .unwrap_or(GpuVendor::Other)
        });

        // boot_vga marks the primary display adapter; treat it like a discrete pick
        let discrete = std::fs::read_to_string(device.join("boot_vga"))
            .map(|v| v.trim() == "1")
            .unwrap_or(false);

        adapters.push(GpuInfo {
            vendor,
            name,
            discrete,
        });
    }
    adapters
}

/// Concrete decoder implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// NVIDIA NVDEC
    Nvdec,
    /// Intel Quick Sync Video
    QuickSync,
    /// Linux Video Acceleration API
    Vaapi,
    /// Windows D3D11 video decoding
    D3d11,
    /// macOS VideoToolbox
    VideoToolbox,
    /// V4L2 memory-to-memory decoder (Raspberry Pi / embedded)
    V4l2,
    /// Cisco OpenH264 software decoder
    OpenH264,
    /// GStreamer software decoders (avdec_*, dav1ddec)
    GstSoftware,
}

impl BackendKind {
    pub fn is_software(&self) -> bool {
        matches!(self, BackendKind::OpenH264 | BackendKind::GstSoftware)
    }

    pub fn descriptor(&self) -> &'static BackendDescriptor {
        // BACKENDS is indexed in declaration order
        &BACKENDS[*self as usize]
    }

    /// GStreamer decoder element for this backend, in preference order
    pub fn gstreamer_elements(&self, codec: VideoCodec) -> &'static [&'static str] {
        use VideoCodec::*;
        match (self, codec) {
            (BackendKind::Nvdec, H264) => &["nvh264dec", "nvd3d11h264dec"],
            (BackendKind::Nvdec, H265) => &["nvh265dec", "nvd3d11h265dec"],
            (BackendKind::Nvdec, AV1) => &["nvav1dec"],
            (BackendKind::QuickSync, H264) => &["qsvh264dec", "msdkh264dec"],
            (BackendKind::QuickSync, H265) => &["qsvh265dec", "msdkh265dec"],
            (BackendKind::QuickSync, AV1) => &["qsvav1dec", "msdkav1dec"],
            (BackendKind::Vaapi, H264) => &["vah264dec", "vaapih264dec"],
            (BackendKind::Vaapi, H265) => &["vah265dec", "vaapih265dec"],
            (BackendKind::Vaapi, AV1) => &["vaav1dec", "vaapiav1dec"],
            (BackendKind::D3d11, H264) => &["d3d11h264dec"],
            (BackendKind::D3d11, H265) => &["d3d11h265dec"],
            (BackendKind::D3d11, AV1) => &["d3d11av1dec"],
            (BackendKind::VideoToolbox, _) => &["vtdec_hw", "vtdec"],
            (BackendKind::V4l2, H264) => &["v4l2h264dec", "v4l2slh264dec"],
            (BackendKind::V4l2, H265) => &["v4l2h265dec", "v4l2slh265dec"],
            (BackendKind::V4l2, AV1) => &[],
            (BackendKind::GstSoftware, H264) => &["avdec_h264"],
            (BackendKind::GstSoftware, H265) => &["avdec_h265"],
            (BackendKind::GstSoftware, AV1) => &["dav1ddec", "av1dec"],
            (BackendKind::OpenH264, _) => &[],
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descriptor().name)
    }
}

/// Static description of a decoder backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    pub name: &'static str,
    pub codecs: &'static [VideoCodec],
    /// Hands out GPU-resident surfaces instead of CPU planes
    pub gpu_output: bool,
    pub platforms: &'static [Platform],
}

impl BackendDescriptor {
    pub fn supports(&self, codec: VideoCodec) -> bool {
        self.codecs.contains(&codec)
    }

    pub fn runs_on(&self, platform: Platform) -> bool {
        self.platforms.contains(&platform)
    }
}

const ALL_CODECS: &[VideoCodec] = &[VideoCodec::H264, VideoCodec::H265, VideoCodec::AV1];
const ALL_PLATFORMS: &[Platform] = &[
    Platform::Windows,
    Platform::MacOS,
    Platform::Linux,
    Platform::Other,
];

/// Every known backend, in `BackendKind` declaration order
pub static BACKENDS: [BackendDescriptor; 8] = [
    BackendDescriptor {
        kind: BackendKind::Nvdec,
        name: "NVDEC",
        codecs: ALL_CODECS,
        gpu_output: true,
        platforms: &[Platform::Windows, Platform::Linux],
    },
    BackendDescriptor {
        kind: BackendKind::QuickSync,
        name: "QuickSync",
        codecs: ALL_CODECS,
        gpu_output: true,
        platforms: &[Platform::Windows, Platform::Linux],
    },
    BackendDescriptor {
        kind: BackendKind::Vaapi,
        name: "VA-API",
        codecs: ALL_CODECS,
        gpu_output: true,
        platforms: &[Platform::Linux],
    },
    BackendDescriptor {
        kind: BackendKind::D3d11,
        name: "D3D11",
        codecs: ALL_CODECS,
        gpu_output: true,
        platforms: &[Platform::Windows],
    },
    BackendDescriptor {
        kind: BackendKind::VideoToolbox,
        name: "VideoToolbox",
        codecs: ALL_CODECS,
        gpu_output: true,
        platforms: &[Platform::MacOS],
    },
    BackendDescriptor {
        kind: BackendKind::V4l2,
        name: "V4L2",
        codecs: &[VideoCodec::H264, VideoCodec::H265],
        gpu_output: true,
        platforms: &[Platform::Linux],
    },
    BackendDescriptor {
        kind: BackendKind::OpenH264,
        name: "OpenH264",
        codecs: &[VideoCodec::H264],
        gpu_output: false,
        platforms: ALL_PLATFORMS,
    },
    BackendDescriptor {
        kind: BackendKind::GstSoftware,
        name: "GStreamer Software",
        codecs: ALL_CODECS,
        gpu_output: false,
        platforms: ALL_PLATFORMS,
    },
];

/// Software tier appended to every hardware table
const SOFTWARE_TIER: [BackendKind; 2] = [BackendKind::OpenH264, BackendKind::GstSoftware];

/// Hardware priority order per platform and vendor
fn hardware_priority(platform: Platform, vendor: GpuVendor) -> &'static [BackendKind] {
    use BackendKind::*;
    match (platform, vendor) {
        (Platform::Windows, GpuVendor::Nvidia) => &[Nvdec, D3d11],
        (Platform::Windows, GpuVendor::Intel) => &[QuickSync, D3d11],
        (Platform::Windows, _) => &[D3d11],
        (Platform::MacOS, _) => &[VideoToolbox],
        (Platform::Linux, GpuVendor::Nvidia) => &[Nvdec, Vaapi],
        (Platform::Linux, GpuVendor::Intel) => &[Vaapi, QuickSync],
        (Platform::Linux, GpuVendor::Broadcom) => &[V4l2],
        (Platform::Linux, _) => &[Vaapi],
        (Platform::Other, _) => &[],
    }
}

/// Backends that can actually be opened on this machine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendAvailability {
    available: HashSet<BackendKind>,
}

impl BackendAvailability {
    /// Nothing available
    pub fn none() -> Self {
        Self::default()
    }

    /// Everything available (tests, forced configurations)
    pub fn all() -> Self {
        Self::with(BACKENDS.iter().map(|b| b.kind))
    }

    pub fn with(kinds: impl IntoIterator<Item = BackendKind>) -> Self {
        Self {
            available: kinds.into_iter().collect(),
        }
    }

    pub fn insert(&mut self, kind: BackendKind) {
        self.available.insert(kind);
    }

    pub fn is_available(&self, kind: BackendKind) -> bool {
        self.available.contains(&kind)
    }
}

/// Probe which backends this build and machine can open for `codec`
pub fn probe_available_backends(platform: Platform, codec: VideoCodec) -> BackendAvailability {
    let mut availability = BackendAvailability::none();

    for descriptor in BACKENDS.iter() {
        if !descriptor.runs_on(platform) || !descriptor.supports(codec) {
            continue;
        }
        let available = match descriptor.kind {
            BackendKind::OpenH264 => cfg!(feature = "openh264"),
            #[cfg(feature = "gstreamer")]
            kind => kind
                .gstreamer_elements(codec)
                .iter()
                .any(|element| super::is_gstreamer_element_available(element)),
            #[cfg(not(feature = "gstreamer"))]
            _ => false,
        };
        debug!(
            "Backend {} for {:?}: {}",
            descriptor.name,
            codec,
            if available { "available" } else { "unavailable" }
        );
        if available {
            availability.insert(descriptor.kind);
        }
    }

    availability
}

/// Everything the selector is a function of
#[derive(Debug, Clone)]
pub struct SelectionInput {
    pub platform: Platform,
    pub vendor: GpuVendor,
    pub codec: VideoCodec,
    pub preference: VideoDecoderBackend,
    pub availability: BackendAvailability,
    /// Backends that already faulted this session
    pub excluded: Vec<BackendKind>,
}

impl SelectionInput {
    /// Probe the current machine
    pub fn probe(codec: VideoCodec, preference: VideoDecoderBackend) -> Self {
        let platform = Platform::current();
        Self {
            platform,
            vendor: detect_gpu_vendor(),
            codec,
            preference,
            availability: probe_available_backends(platform, codec),
            excluded: Vec::new(),
        }
    }

    /// Exclude a faulted backend from further selections
    pub fn exclude(&mut self, kind: BackendKind) {
        if !self.excluded.contains(&kind) {
            self.excluded.push(kind);
        }
    }
}

/// Backend a user preference refers to
pub fn preferred_kind(preference: VideoDecoderBackend, codec: VideoCodec) -> Option<BackendKind> {
    match preference {
        VideoDecoderBackend::Auto => None,
        VideoDecoderBackend::Cuvid => Some(BackendKind::Nvdec),
        VideoDecoderBackend::Qsv => Some(BackendKind::QuickSync),
        VideoDecoderBackend::Vaapi => Some(BackendKind::Vaapi),
        VideoDecoderBackend::Dxva => Some(BackendKind::D3d11),
        VideoDecoderBackend::VideoToolbox => Some(BackendKind::VideoToolbox),
        VideoDecoderBackend::V4l2 => Some(BackendKind::V4l2),
        VideoDecoderBackend::Software => Some(if codec == VideoCodec::H264 {
            BackendKind::OpenH264
        } else {
            BackendKind::GstSoftware
        }),
    }
}

/// Ordered candidate list. The head is the backend to open.
pub fn select_backends(input: &SelectionInput) -> Vec<BackendDescriptor> {
    let usable = |kind: BackendKind| {
        let descriptor = kind.descriptor();
        descriptor.runs_on(input.platform)
            && descriptor.supports(input.codec)
            && input.availability.is_available(kind)
            && !input.excluded.contains(&kind)
    };

    let mut order: Vec<BackendKind> = hardware_priority(input.platform, input.vendor)
        .iter()
        .chain(SOFTWARE_TIER.iter())
        .copied()
        .collect();

    if let Some(preferred) = preferred_kind(input.preference, input.codec) {
        if usable(preferred) {
            order.retain(|k| *k != preferred);
            order.insert(0, preferred);
        } else {
            warn!(
                "Preferred decoder {} is not usable for {:?}, using automatic order",
                preferred, input.codec
            );
        }
    }

    order
        .into_iter()
        .filter(|k| usable(*k))
        .map(|k| *k.descriptor())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(platform: Platform, vendor: GpuVendor, codec: VideoCodec) -> SelectionInput {
        SelectionInput {
            platform,
            vendor,
            codec,
            preference: VideoDecoderBackend::Auto,
            availability: BackendAvailability::all(),
            excluded: Vec::new(),
        }
    }

    fn kinds(list: &[BackendDescriptor]) -> Vec<BackendKind> {
        list.iter().map(|d| d.kind).collect()
    }

    #[test]
    fn test_descriptor_table_order() {
        for (i, descriptor) in BACKENDS.iter().enumerate() {
            assert_eq!(descriptor.kind as usize, i);
        }
    }

    #[test]
    fn test_priority_tables() {
        use BackendKind::*;
        let cases = [
            (Platform::Windows, GpuVendor::Nvidia, vec![Nvdec, D3d11, OpenH264, GstSoftware]),
            (Platform::Windows, GpuVendor::Intel, vec![QuickSync, D3d11, OpenH264, GstSoftware]),
            (Platform::Windows, GpuVendor::Amd, vec![D3d11, OpenH264, GstSoftware]),
            (Platform::MacOS, GpuVendor::Apple, vec![VideoToolbox, OpenH264, GstSoftware]),
            (Platform::Linux, GpuVendor::Nvidia, vec![Nvdec, Vaapi, OpenH264, GstSoftware]),
            (Platform::Linux, GpuVendor::Intel, vec![Vaapi, QuickSync, OpenH264, GstSoftware]),
            (Platform::Linux, GpuVendor::Amd, vec![Vaapi, OpenH264, GstSoftware]),
            (Platform::Linux, GpuVendor::Broadcom, vec![V4l2, OpenH264, GstSoftware]),
        ];
        for (platform, vendor, expected) in cases {
            let selected = select_backends(&input(platform, vendor, VideoCodec::H264));
            assert_eq!(kinds(&selected), expected, "{:?}/{:?}", platform, vendor);
        }
    }

    #[test]
    fn test_software_fallback_for_h265_is_gstreamer() {
        let selected = select_backends(&input(Platform::Linux, GpuVendor::Amd, VideoCodec::H265));
        assert_eq!(
            kinds(&selected),
            vec![BackendKind::Vaapi, BackendKind::GstSoftware]
        );
    }

    #[test]
    fn test_av1_skips_v4l2() {
        let selected =
            select_backends(&input(Platform::Linux, GpuVendor::Broadcom, VideoCodec::AV1));
        assert_eq!(kinds(&selected), vec![BackendKind::GstSoftware]);
    }

    #[test]
    fn test_user_override_moves_to_front() {
        let mut selection = input(Platform::Windows, GpuVendor::Nvidia, VideoCodec::H264);
        selection.preference = VideoDecoderBackend::Dxva;
        let selected = select_backends(&selection);
        assert_eq!(
            kinds(&selected),
            vec![
                BackendKind::D3d11,
                BackendKind::Nvdec,
                BackendKind::OpenH264,
                BackendKind::GstSoftware
            ]
        );

        // Off-table but applicable backend is inserted at the front
        let mut selection = input(Platform::Linux, GpuVendor::Amd, VideoCodec::H264);
        selection.preference = VideoDecoderBackend::Qsv;
        assert_eq!(select_backends(&selection)[0].kind, BackendKind::QuickSync);
    }

    #[test]
    fn test_unavailable_override_is_ignored() {
        let mut selection = input(Platform::MacOS, GpuVendor::Apple, VideoCodec::H264);
        selection.preference = VideoDecoderBackend::Cuvid;
        assert_eq!(select_backends(&selection)[0].kind, BackendKind::VideoToolbox);
    }

    #[test]
    fn test_reevaluation_excludes_faulted() {
        let mut selection = input(Platform::Linux, GpuVendor::Nvidia, VideoCodec::H264);
        selection.exclude(BackendKind::Nvdec);
        selection.exclude(BackendKind::Nvdec);
        assert_eq!(selection.excluded.len(), 1);
        assert_eq!(select_backends(&selection)[0].kind, BackendKind::Vaapi);
    }

    #[test]
    fn test_availability_filters_candidates() {
        let mut selection = input(Platform::Linux, GpuVendor::Intel, VideoCodec::H264);
        selection.availability = BackendAvailability::with([BackendKind::OpenH264]);
        assert_eq!(kinds(&select_backends(&selection)), vec![BackendKind::OpenH264]);

        selection.availability = BackendAvailability::none();
        assert!(select_backends(&selection).is_empty());
    }

    #[test]
    fn test_vendor_classification() {
        assert_eq!(
            GpuVendor::from_adapter_name("NVIDIA GeForce RTX 4080"),
            GpuVendor::Nvidia
        );
        assert_eq!(
            GpuVendor::from_adapter_name("V3D 4.2"),
            GpuVendor::Broadcom
        );
        assert_eq!(GpuVendor::from_pci_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_pci_id(0x1234), GpuVendor::Other);
    }

    #[test]
    fn test_discrete_adapter_wins() {
        let best = pick_best_adapter([
            GpuInfo {
                vendor: GpuVendor::Intel,
                name: "Intel UHD 770".into(),
                discrete: false,
            },
            GpuInfo {
                vendor: GpuVendor::Amd,
                name: "Radeon RX 7800".into(),
                discrete: true,
            },
        ]);
        assert_eq!(best.map(|g| g.vendor), Some(GpuVendor::Amd));
        assert!(pick_best_adapter(Vec::new()).is_none());
    }
}
