use serde_json::json;

use crate::{AppContext, OutputFormat, Result};

pub async fn execute(context: AppContext, format: OutputFormat) -> Result<()> {
    let appliances = context.discovery.discover().await?;
    context.pool.register_appliances(&appliances).await;

    match format {
        OutputFormat::Json => {
            let entries: Vec<_> = appliances
                .iter()
                .map(|appliance| {
                    json!({
                        "device_id": appliance.device_id,
                        "ip": appliance.ip_address,
                        "friendly_name": appliance.friendly_name,
                        "model": appliance.model_number,
                        "tuners": appliance.tuner_count,
                        "dvr": appliance.dvr_capable(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        OutputFormat::Text => {
            if appliances.is_empty() {
                println!("no appliances found");
            }
            for appliance in &appliances {
                println!(
                    "{}  {:15}  {}  tuners={}  dvr={}",
                    appliance.device_id,
                    appliance.ip_address,
                    appliance.friendly_name.as_deref().unwrap_or("-"),
                    appliance.tuner_count,
                    if appliance.dvr_capable() { "yes" } else { "no" },
                );
            }
        }
    }
    Ok(())
}
