//! Texshare Probe - backend capabilities and loopback sharing checks.
//!
//! Usage:
//!   texshare-probe [OPTIONS]
//!
//! Options:
//!   --backend <name>   Only run the loopback for one backend (e.g. `DmaBuf`)
//!   --format <name>    Texture format of the shared allocation (default: rgba8unorm)
//!   --vulkan           Query external semaphore support from the Vulkan driver
//!   --validation       Enable Vulkan validation layers (implies --vulkan)
//!   -h, --help         Print help information
//!
//! Environment Variables:
//!   `RUST_LOG`           Log filter (default: info)

use anyhow::{bail, Context as _};
use texshare_core::{Extent3d, TextureFormat, TextureUsage};
use texshare_gpu::{
    BackendKind, BackendStateKind, Context, DeviceContext, FenceValue, VulkanProbe,
};
use texshare_memory::{
    BackendState, BeginAccessDescriptor, CommandEncoder, LoadOp, PlatformTexture,
    PlatformTextureDescriptor, Queue, SharedTextureMemory, SharedTextureMemoryDescriptor, StoreOp,
};

const CLEAR_COLOR: [f32; 4] = [0.0, 1.0, 0.0, 1.0];

/// Probe configuration.
#[derive(Debug, Clone)]
struct ProbeConfig {
    backend: Option<BackendKind>,
    format: TextureFormat,
    size: Extent3d,
    vulkan: bool,
    validation: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            backend: None,
            format: TextureFormat::Rgba8Unorm,
            size: Extent3d::new_2d(4, 4),
            vulkan: false,
            validation: false,
        }
    }
}

impl ProbeConfig {
    /// Parse configuration from command line arguments.
    fn from_args() -> anyhow::Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let mut config = Self::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--backend" => {
                    i += 1;
                    let name = args.get(i).context("--backend needs a value")?;
                    config.backend = Some(parse_backend(name)?);
                }
                "--format" => {
                    i += 1;
                    let name = args.get(i).context("--format needs a value")?;
                    config.format = name.parse()?;
                }
                "--vulkan" => config.vulkan = true,
                "--validation" => {
                    config.vulkan = true;
                    config.validation = true;
                }
                other => {
                    tracing::warn!("Ignoring unknown argument: {}", other);
                }
            }
            i += 1;
        }

        Ok(config)
    }

    fn backends(&self) -> Vec<BackendKind> {
        self.backend
            .map_or_else(|| BackendKind::ALL.to_vec(), |backend| vec![backend])
    }
}

fn parse_backend(name: &str) -> anyhow::Result<BackendKind> {
    BackendKind::ALL
        .into_iter()
        .find(|backend| backend.to_string().eq_ignore_ascii_case(name))
        .with_context(|| format!("Unknown backend: {name}"))
}

fn print_help() {
    eprintln!(
        r"Texshare Probe - backend capabilities and loopback sharing checks

USAGE:
    texshare-probe [OPTIONS]

OPTIONS:
    --backend <name>   Only run the loopback for one backend (e.g. DmaBuf)
    --format <name>    Texture format of the shared allocation (default: rgba8unorm)
    --vulkan           Query external semaphore support from the Vulkan driver
    --validation       Enable Vulkan validation layers (implies --vulkan)
    -h, --help         Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG           Log filter (default: info)

EXAMPLES:
    texshare-probe
    texshare-probe --backend DmaBuf --format nv12
    RUST_LOG=texshare_memory=debug texshare-probe --vulkan"
    );
}

fn init_logging() {
    #[cfg(feature = "profiling-tracy")]
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        use tracing_subscriber::EnvFilter;

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }

    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    init_logging();
    let config = ProbeConfig::from_args()?;

    print_capabilities();
    if config.vulkan {
        probe_vulkan(config.validation);
    }

    let mut failures = 0;
    for backend in config.backends() {
        match loopback(backend, &config) {
            Ok(summary) => println!("{backend}: ok ({summary})"),
            Err(e) => {
                failures += 1;
                println!("{backend}: FAILED ({e:#})");
            }
        }
    }

    if failures > 0 {
        bail!("{failures} backend loopback(s) failed");
    }
    Ok(())
}

fn print_capabilities() {
    println!(
        "{:<18} {:<26} {:>6} {:>10} {:>10} {:>6} {:<14} {:>6}",
        "backend", "fences", "mutex", "read-intra", "read-cross", "same", "state", "planar"
    );
    for backend in BackendKind::ALL {
        let caps = backend.capabilities();
        let fences = caps
            .fence_kinds
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<18} {:<26} {:>6} {:>10} {:>10} {:>6} {:<14} {:>6}",
            backend.to_string(),
            fences,
            caps.uses_keyed_mutex,
            caps.concurrent_read_intra_device,
            caps.concurrent_read_cross_device,
            caps.use_same_device,
            format!("{:?}", caps.state_kind),
            caps.supports_multi_planar,
        );
    }
    println!();
}

fn probe_vulkan(validation: bool) {
    let probe = match VulkanProbe::new(validation) {
        Ok(probe) => probe,
        Err(e) => {
            tracing::warn!("Vulkan probe unavailable: {}", e);
            return;
        }
    };

    println!("Vulkan device: {}", probe.device_name());
    for entry in probe.semaphore_support() {
        println!(
            "  {:<26} export={} import={}",
            entry.kind.to_string(),
            entry.support.exportable,
            entry.support.importable
        );
    }
    match probe.opaque_fd_round_trip() {
        Ok(fd) => println!("  opaque fd round trip: ok (fd {fd})"),
        Err(e) => tracing::warn!("Opaque fd round trip failed: {}", e),
    }
    println!();
}

const fn begin_state(backend: BackendKind) -> BackendState {
    match backend.capabilities().state_kind {
        BackendStateKind::VkImageLayout => BackendState::UNDEFINED_LAYOUT,
        _ => BackendState::None,
    }
}

/// Write on one device, hand the allocation to a second device and read it back.
fn loopback(backend: BackendKind, config: &ProbeConfig) -> anyhow::Result<String> {
    let caps = backend.capabilities();
    let context = Context::builder()
        .label(format!("{backend} probe"))
        .build();
    let writer_device = DeviceContext::builder(backend)
        .label("writer")
        .build(&context)?;
    let mut reader_builder = DeviceContext::builder(backend).label("reader");
    if caps.use_same_device {
        reader_builder = reader_builder.native_device(writer_device.native_device());
    }
    let reader_device = reader_builder.build(&context)?;

    let mut platform_desc =
        PlatformTextureDescriptor::new(config.format, config.size, writer_device.native_device())
            .with_label(format!("{backend} {}", config.format))
            .with_usage(TextureUsage::SHAREABLE);
    if caps.uses_keyed_mutex {
        platform_desc = platform_desc.with_keyed_mutex();
    }
    let platform = PlatformTexture::new(platform_desc)?;

    let writer_memory = import(&writer_device, &platform, backend)?;
    let mut writer = writer_memory.create_texture(None)?;
    writer.begin_access(&BeginAccessDescriptor::new(false).with_backend_state(begin_state(backend)))?;
    let wrote = writer.usage().contains(TextureUsage::RENDER_ATTACHMENT);
    if wrote {
        let mut encoder = CommandEncoder::new(&writer_device);
        encoder.render_pass(&writer, LoadOp::Clear(CLEAR_COLOR), StoreOp::Store);
        Queue::new(&writer_device).submit(encoder.finish())?;
    }
    let end = writer.end_access()?;
    tracing::debug!(
        "{} writer ended with {} fence(s), initialized={}",
        backend,
        end.fences.len(),
        end.initialized
    );

    let fences = end
        .fences
        .iter()
        .map(|wait| -> texshare_gpu::Result<FenceValue> {
            let payload = writer_device.export_fence(&wait.fence)?;
            let fence = reader_device.import_fence(&payload)?;
            Ok(FenceValue::new(fence, wait.value))
        })
        .collect::<texshare_gpu::Result<Vec<_>>>()?;

    let reader_memory = import(&reader_device, &platform, backend)?;
    let mut reader = reader_memory.create_texture(None)?;
    reader.begin_access(
        &BeginAccessDescriptor::new(end.initialized)
            .with_fences(fences)
            .with_backend_state(begin_state(backend)),
    )?;
    let mut encoder = CommandEncoder::new(&reader_device);
    let id = encoder.readback(&reader);
    let work = Queue::new(&reader_device).submit(encoder.finish())?;
    reader.end_access()?;

    let planes = work.readback(id);
    let bytes: usize = planes.iter().map(Vec::len).sum();
    if wrote {
        let texel = config
            .format
            .encode_rgba(CLEAR_COLOR)
            .context("format has no texel encoding")?;
        let plane = planes.first().context("readback returned no planes")?;
        if plane.chunks(texel.len()).any(|chunk| chunk != texel.as_slice()) {
            bail!("reader saw different contents than the writer cleared");
        }
        Ok(format!("{} fence(s), {bytes} bytes verified", end.fences.len()))
    } else {
        Ok(format!("{} plane(s), {bytes} bytes read, not renderable", planes.len()))
    }
}

fn import(
    device: &DeviceContext,
    platform: &PlatformTexture,
    backend: BackendKind,
) -> anyhow::Result<SharedTextureMemory> {
    let chain = platform.export(device.context(), backend)?;
    let desc = SharedTextureMemoryDescriptor::new(chain)
        .with_label(format!("{} on {}", platform.label(), device.label()));
    SharedTextureMemory::import(device, &desc)
        .with_context(|| format!("Failed to import into {}", device.label()))
}
