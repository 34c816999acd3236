//! Port listing command implementation.

use {
    crate::config::Config,
    anyhow::Result,
    console::style,
    zwaflash::{DetectedPort, auto_detect_port, detect_ports},
};

/// JSON record for one port.
fn port_json(port: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": port.name,
        "device": port.device.name(),
        "known": port.device.is_known(),
        "vid": port.vid,
        "pid": port.pid,
        "manufacturer": port.manufacturer,
        "product": port.product,
        "serial": port.serial,
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(config: &Config, json: bool) -> Result<()> {
    let extra = config
        .port
        .extra_ids();
    let detected = detect_ports(&extra);

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(port_json)
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": ports,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Available serial ports:")
            .bold()
            .underlined()
    );

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for (port, line) in detected
        .iter()
        .zip(zwaflash::device::format_port_list(&detected))
    {
        let marker = if port
            .device
            .is_known()
        {
            style("•").green()
        } else {
            style("•").dim()
        };
        eprintln!("  {marker} {line}");
    }

    if let Ok(adapter) = auto_detect_port(&extra) {
        eprintln!(
            "\n{} Adapter detected on {}",
            style("→")
                .green()
                .bold(),
            style(&adapter.name)
                .cyan()
                .bold()
        );
    }

    Ok(())
}
