//! Firmware info and port listing command implementations.

use {
    anyhow::{Context, Result},
    console::style,
    log::warn,
    std::{fs, path::Path},
    uartota::{ImageInfo, NativePortEnumerator, PortEnumerator, PortInfo},
};

/// Info command implementation.
pub(crate) fn cmd_info(firmware: &Path, json: bool) -> Result<()> {
    let image = fs::read(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    let info = ImageInfo::inspect(&image);

    if json {
        return print_info_json(&info);
    }

    eprintln!(
        "{} Loaded firmware: {}",
        style("📦").cyan(),
        firmware.display()
    );
    eprintln!(
        "\n{}",
        style("Image")
            .bold()
            .underlined()
    );
    eprintln!("  Size:          {} bytes", info.size);
    eprintln!("  CRC32:         0x{:08X}", info.crc32);
    eprintln!(
        "  Header magic:  {}",
        if info.header_magic_ok { "ok" } else { "invalid" }
    );

    match &info.description {
        Some(desc) => {
            eprintln!(
                "\n{}",
                style("App descriptor")
                    .bold()
                    .underlined()
            );
            eprintln!(
                "  Magic:         0x{:08X} ({})",
                desc.magic,
                if desc.has_valid_magic() { "ok" } else { "invalid" }
            );
            eprintln!("  Project:       {}", style(&desc.project_name).cyan().bold());
            eprintln!("  Version:       {}", desc.version);
            eprintln!("  Secure ver:    {}", desc.secure_version);
            eprintln!("  Built:         {} {}", desc.date, desc.time);
            eprintln!("  SDK:           {}", desc.idf_version);
            eprintln!("  ELF SHA-256:   {}", desc.elf_sha256_hex());
        },
        None => eprintln!("\n  {}", style("No app descriptor (image too short)").dim()),
    }

    if !info.looks_valid() {
        eprintln!(
            "\n{} {}",
            style("⚠").yellow(),
            style("A device would reject this image").yellow()
        );
    }

    Ok(())
}

fn print_info_json(info: &ImageInfo) -> Result<()> {
    let description = info
        .description
        .as_ref()
        .map(|desc| {
            serde_json::json!({
                "magic": format!("0x{:08X}", desc.magic),
                "magic_ok": desc.has_valid_magic(),
                "project_name": desc.project_name,
                "version": desc.version,
                "secure_version": desc.secure_version,
                "date": desc.date,
                "time": desc.time,
                "idf_version": desc.idf_version,
                "elf_sha256": desc.elf_sha256_hex(),
            })
        });

    let output = serde_json::json!({
        "ok": true,
        "data": {
            "size": info.size,
            "crc32": format!("0x{:08X}", info.crc32),
            "header_magic_ok": info.header_magic_ok,
            "valid": info.looks_valid(),
            "description": description,
        }
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&output)?
    );
    Ok(())
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = NativePortEnumerator::list_ports().unwrap_or_else(|e| {
        warn!("Could not enumerate serial ports: {e}");
        Vec::new()
    });

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output)?
        );
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Available serial ports")
            .bold()
            .underlined()
    );

    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
    } else {
        for port in &ports {
            eprintln!("  {} {}", style("•").green(), describe_port(port));
        }
    }

    Ok(())
}

fn describe_port(port: &PortInfo) -> String {
    let mut line = style(&port.name)
        .cyan()
        .to_string();
    if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        line.push_str(&format!(" ({vid:04X}:{pid:04X})"));
    }
    if let Some(product) = port
        .product
        .as_deref()
        .filter(|p| !p.is_empty())
    {
        line.push_str(&format!(" - {}", style(product).dim()));
    }
    line
}
