use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tdx_premeasure::{resolve_key_provider, Machine, TdxMeasurements};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to firmware file
    #[arg(long)]
    fw: Option<PathBuf>,

    /// Path to kernel file
    #[arg(long)]
    kernel: Option<PathBuf>,

    /// Path to initrd file
    #[arg(long)]
    initrd: Option<PathBuf>,

    /// Memory size (e.g., 512M, 1G, 2G)
    #[arg(short, long, default_value = "2G", value_parser = parse_memory_size)]
    memory: u64,

    /// Number of CPUs
    #[arg(short, long, default_value = "1")]
    cpu: u8,

    /// Kernel command line
    #[arg(long, default_value = "")]
    cmdline: String,

    /// TCB_SVN major version of the target platform (6 or 7)
    #[arg(long, default_value = "7")]
    tcbver: u8,

    /// Measurement of the key provider (64 hex characters or a known alias)
    #[arg(
        long,
        default_value = "0000000000000000000000000000000000000000000000000000000000000000"
    )]
    mrkp: String,

    /// Directory with template_qemu_cpu<N>.hex files (embedded catalog when omitted)
    #[arg(long)]
    templates: Option<PathBuf>,

    /// Path to a metadata json file supplying defaults for the paths above
    #[arg(long)]
    metadata: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long)]
    json: bool,

    /// Path to a rootfs image measured into RTMR3
    #[arg(long)]
    rootfs: Option<PathBuf>,

    /// Path to a docker-compose file measured into RTMR3
    #[arg(long)]
    dockercompose: Option<PathBuf>,

    /// Dockerfiles measured into RTMR3 (repeatable)
    #[arg(long)]
    dockerfiles: Vec<PathBuf>,
}

/// Defaults for the guest definition, with paths resolved relative to the
/// metadata file's directory.
#[derive(Debug, Deserialize)]
struct Metadata {
    bios: String,
    kernel: String,
    #[serde(default)]
    cmdline: String,
    #[serde(default)]
    initrd: String,
}

#[derive(Serialize)]
struct MeasurementOutput {
    mrtd: String,
    rtmr0: String,
    rtmr1: String,
    rtmr2: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rtmr3: Option<String>,
    mr_aggregated: String,
    mr_image: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let mut cli = Cli::parse();
    if let Some(metadata_path) = cli.metadata.clone() {
        apply_metadata(&mut cli, &metadata_path)?;
    }

    let required = |path: &Option<PathBuf>| {
        path.clone().ok_or_else(|| {
            anyhow!("firmware and kernel paths are required (either directly or via a metadata file)")
        })
    };
    let fw = required(&cli.fw)?.display().to_string();
    let kernel = required(&cli.kernel)?.display().to_string();

    if cli.tcbver != 6 && cli.tcbver != 7 {
        bail!("unsupported TCB_SVN version {}, expected 6 or 7", cli.tcbver);
    }
    let mr_key_provider = resolve_key_provider(&cli.mrkp)?;

    let display = |path: &PathBuf| path.display().to_string();
    let initrd = cli.initrd.as_ref().map(display).unwrap_or_default();
    let templates_dir = cli.templates.as_ref().map(display);
    let rootfs = cli.rootfs.as_ref().map(display);
    let docker_compose = cli.dockercompose.as_ref().map(display);
    let dockerfiles: Vec<String> = cli.dockerfiles.iter().map(display).collect();

    let machine = Machine::builder()
        .cpu_count(cli.cpu)
        .memory_size(cli.memory)
        .firmware(&fw)
        .kernel(&kernel)
        .initrd(&initrd)
        .kernel_cmdline(&cli.cmdline)
        .two_pass_add_pages(cli.tcbver == 6)
        .maybe_templates_dir(templates_dir.as_deref())
        .maybe_rootfs(rootfs.as_deref())
        .maybe_docker_compose(docker_compose.as_deref())
        .dockerfiles(dockerfiles.iter().map(String::as_str).collect())
        .build();

    let measurements = machine
        .measure()
        .context("Failed to measure machine configuration")?;
    output_measurements(&cli, &measurements, &mr_key_provider)
}

fn apply_metadata(cli: &mut Cli, metadata_path: &Path) -> Result<()> {
    let metadata_dir = metadata_path.parent().unwrap_or(Path::new("."));
    let data = fs::read_to_string(metadata_path).context("Failed to read metadata file")?;
    let metadata: Metadata =
        serde_json::from_str(&data).context("Failed to parse metadata file")?;

    if cli.fw.is_none() {
        cli.fw = Some(metadata_dir.join(&metadata.bios));
    }
    if cli.kernel.is_none() {
        cli.kernel = Some(metadata_dir.join(&metadata.kernel));
    }
    if cli.initrd.is_none() && !metadata.initrd.is_empty() {
        cli.initrd = Some(metadata_dir.join(&metadata.initrd));
    }
    if cli.cmdline.is_empty() {
        cli.cmdline = metadata.cmdline;
        if !metadata.initrd.is_empty() {
            cli.cmdline.push_str(" initrd=initrd");
        }
    }
    Ok(())
}

fn output_measurements(
    cli: &Cli,
    measurements: &TdxMeasurements,
    mr_key_provider: &[u8],
) -> Result<()> {
    let rtmr3 = (!measurements.rtmr3.is_empty()).then(|| hex::encode(&measurements.rtmr3));
    let output = MeasurementOutput {
        mrtd: hex::encode(&measurements.mrtd),
        rtmr0: hex::encode(&measurements.rtmr0),
        rtmr1: hex::encode(&measurements.rtmr1),
        rtmr2: hex::encode(&measurements.rtmr2),
        rtmr3,
        mr_aggregated: measurements.mr_aggregated(mr_key_provider),
        mr_image: measurements.mr_image(),
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("MRTD: {}", output.mrtd);
        println!("RTMR0: {}", output.rtmr0);
        println!("RTMR1: {}", output.rtmr1);
        println!("RTMR2: {}", output.rtmr2);
        match &output.rtmr3 {
            Some(rtmr3) => println!("RTMR3: {rtmr3}"),
            // Nothing extends RTMR3 on a plain boot, so it keeps its launch
            // value of all zeroes.
            None => println!("RTMR3: {}", hex::encode([0u8; 48])),
        }
        println!("mr_aggregated: {}", output.mr_aggregated);
        println!("mr_image: {}", output.mr_image);
    }
    Ok(())
}

/// Parse a memory size value that can be decimal or hexadecimal (with 0x
/// prefix), with an optional K/M/G/T suffix.
fn parse_memory_size(s: &str) -> Result<u64> {
    let s = s.trim();

    if s.is_empty() {
        return Err(anyhow!("Empty memory size"));
    }
    if s.starts_with("0x") || s.starts_with("0X") {
        let hex_str = &s[2..];
        return u64::from_str_radix(hex_str, 16)
            .map_err(|e| anyhow!("Invalid hexadecimal value: {}", e));
    }

    if s.chars().all(|c| c.is_ascii_digit()) {
        return Ok(s.parse::<u64>()?);
    }
    let len = s.len();
    let (num_part, suffix) = match s.chars().last().unwrap() {
        'k' | 'K' => (&s[0..len - 1], 1024u64),
        'm' | 'M' => (&s[0..len - 1], 1024u64 * 1024),
        'g' | 'G' => (&s[0..len - 1], 1024u64 * 1024 * 1024),
        't' | 'T' => (&s[0..len - 1], 1024u64 * 1024 * 1024 * 1024),
        _ => return Err(anyhow!("Unknown memory size suffix")),
    };

    let num = num_part.parse::<u64>()?;
    Ok(num * suffix)
}
