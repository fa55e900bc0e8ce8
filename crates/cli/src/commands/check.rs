//! On-demand scale check

use anyhow::Result;
use colored::Colorize;

use crate::client::ApiClient;
use crate::output::{
    color_status, format_pct, format_timestamp, print_info, print_json, print_success,
    OutputFormat,
};

/// Run a scale check for one instance now
pub async fn run_check(client: &ApiClient, instance_id: &str, format: OutputFormat) -> Result<()> {
    let report = client.check(instance_id).await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            println!("{}", "Scale Check".bold());
            println!("{}", "=".repeat(50));
            println!("Instance:      {}", report.instance_id.cyan());
            println!("Size class:    {}", report.current_size_class);
            println!(
                "CPU:           {} over {}s",
                format_pct(report.sample.cpu_pct),
                report.sample.window_secs
            );
            println!("Memory:        {}", format_pct(report.sample.mem_pct));
            println!("Decision:      {}", color_status(&report.decision.action));
            println!();

            match (report.decision.target, report.schedule_id) {
                (Some(target), Some(schedule_id)) => {
                    let at = report
                        .execution_time
                        .as_deref()
                        .map(format_timestamp)
                        .unwrap_or_default();
                    print_success(&format!("Resize to {} scheduled for {}", target.cyan(), at));
                    println!("Schedule ID: {}", schedule_id);
                }
                _ => print_info("No resize needed"),
            }
        }
    }

    Ok(())
}
