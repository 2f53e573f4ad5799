//! Status, abort and rollback command implementations.

use {
    anyhow::{Context, Result},
    console::style,
    uartota::{SenderConfig, StatusReport},
};

use super::Target;

/// Status command implementation.
pub(crate) fn cmd_status(target: &Target, config: SenderConfig, json: bool) -> Result<()> {
    let mut sender = target.sender(config)?;
    let status = sender
        .query_status()
        .context("Status query failed")?;

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": status,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output)?
        );
        return Ok(());
    }

    print_status(&status);
    Ok(())
}

fn print_status(status: &StatusReport) {
    eprintln!(
        "{}",
        style("Device status")
            .bold()
            .underlined()
    );
    eprintln!("  State:           {}", style(status.state).cyan());
    eprintln!("  Last error:      {}", status.last_error);
    eprintln!("  Running version: {}", status.current_version);
    if status.total_bytes > 0 {
        let percent = u64::from(status.received_bytes) * 100 / u64::from(status.total_bytes);
        eprintln!(
            "  Transfer:        {}/{} bytes ({percent}%)",
            status.received_bytes, status.total_bytes
        );
    }
}

/// Abort command implementation.
pub(crate) fn cmd_abort(target: &Target, config: SenderConfig, quiet: bool) -> Result<()> {
    let mut sender = target.sender(config)?;
    sender
        .abort()
        .context("Abort failed")?;
    if !quiet {
        eprintln!("{} Transfer aborted", style("✓").green());
    }
    Ok(())
}

/// Rollback command implementation.
pub(crate) fn cmd_rollback(target: &Target, config: SenderConfig, quiet: bool) -> Result<()> {
    let mut sender = target.sender(config)?;
    sender
        .request_rollback()
        .context("Rollback request failed")?;
    if !quiet {
        eprintln!(
            "{} Rollback accepted, device is restarting into the previous image",
            style("🔄").cyan()
        );
    }
    Ok(())
}
