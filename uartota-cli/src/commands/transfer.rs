//! Send command implementation.

use {
    anyhow::{Context, Result},
    console::style,
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    log::warn,
    std::{fs, path::Path},
    uartota::{FirmwareInfo, ImageInfo, SenderConfig},
};

use {
    super::Target,
    crate::{CliError, use_fancy_output, was_interrupted},
};

/// Version announced when neither the caller nor the image provides one.
const FALLBACK_VERSION: &str = "0.0.0";

/// Pick the version and project name announced in START.
///
/// Explicit values win, then the image descriptor, then fallbacks.
pub(crate) fn resolve_firmware_info(
    firmware: &Path,
    image: &ImageInfo,
    version: Option<&str>,
    project: Option<&str>,
) -> FirmwareInfo {
    let description = image
        .description
        .as_ref()
        .filter(|desc| desc.has_valid_magic());

    let version = version
        .map(str::to_string)
        .or_else(|| {
            description
                .map(|desc| desc.version.clone())
                .filter(|v| !v.is_empty())
        })
        .unwrap_or_else(|| FALLBACK_VERSION.to_string());
    let project = project
        .map(str::to_string)
        .or_else(|| {
            description
                .map(|desc| desc.project_name.clone())
                .filter(|p| !p.is_empty())
        })
        .or_else(|| {
            firmware
                .file_stem()
                .map(|stem| {
                    stem.to_string_lossy()
                        .into_owned()
                })
        })
        .unwrap_or_default();

    FirmwareInfo::new(version, project)
}

/// Send command implementation.
pub(crate) fn cmd_send(
    target: &Target,
    config: SenderConfig,
    firmware: &Path,
    version: Option<&str>,
    project: Option<&str>,
    quiet: bool,
) -> Result<()> {
    if !quiet {
        eprintln!(
            "{} Loading firmware: {}",
            style("📦").cyan(),
            firmware.display()
        );
    }

    let image = fs::read(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    if image.is_empty() {
        return Err(CliError::Usage(format!("{} is empty", firmware.display())).into());
    }

    let inspected = ImageInfo::inspect(&image);
    if !inspected.looks_valid() {
        warn!(
            "{} has no valid image header or app descriptor; the device will reject it",
            firmware.display()
        );
    }
    let info = resolve_firmware_info(firmware, &inspected, version, project);

    if !quiet {
        eprintln!(
            "{} {} v{} ({} bytes, crc32 0x{:08X})",
            style("ℹ").blue(),
            info.project_name,
            info.version,
            inspected.size,
            inspected.crc32
        );
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            target.port,
            target.baud
        );
    }

    let mut sender = target.sender(config)?;

    // Create progress bar
    let pb = if quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(inspected.size as u64);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
                )
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(ProgressDrawTarget::stderr());
        pb
    };
    pb.set_message("sending");

    let result = sender.send_firmware(&image, &info, |sent, total| {
        pb.set_length(u64::from(total));
        pb.set_position(u64::from(sent));
    });

    if let Err(err) = result {
        pb.abandon();
        if was_interrupted() {
            return Err(CliError::Cancelled("Transfer cancelled".to_string()).into());
        }
        return Err(err).with_context(|| format!("Sending {} failed", firmware.display()));
    }

    pb.finish_with_message("done");

    if !quiet {
        eprintln!(
            "\n{} Transfer complete, device is restarting into v{}",
            style("🎉").green().bold(),
            info.version
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::path::PathBuf,
        uartota::AppImageBuilder,
    };

    #[test]
    fn test_resolve_info_from_descriptor() {
        let image = AppImageBuilder::new("3.1.4", "thermostat").build();
        let info = resolve_firmware_info(
            &PathBuf::from("build/app.bin"),
            &ImageInfo::inspect(&image),
            None,
            None,
        );
        assert_eq!(info.version, "3.1.4");
        assert_eq!(info.project_name, "thermostat");
    }

    #[test]
    fn test_resolve_info_explicit_values_win() {
        let image = AppImageBuilder::new("3.1.4", "thermostat").build();
        let info = resolve_firmware_info(
            &PathBuf::from("app.bin"),
            &ImageInfo::inspect(&image),
            Some("9.9.9"),
            Some("override"),
        );
        assert_eq!(info.version, "9.9.9");
        assert_eq!(info.project_name, "override");
    }

    #[test]
    fn test_resolve_info_fallbacks_for_raw_binary() {
        let image = vec![0u8; 64];
        let info = resolve_firmware_info(
            &PathBuf::from("/tmp/blinky.bin"),
            &ImageInfo::inspect(&image),
            None,
            None,
        );
        assert_eq!(info.version, FALLBACK_VERSION);
        assert_eq!(info.project_name, "blinky");
    }
}
