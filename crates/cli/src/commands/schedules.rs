//! Schedule CLI commands: create, cancel and inspect

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{ApiClient, ScheduleRecord, ScheduleRequest};
use crate::output::{
    color_status, format_timestamp, print_info, print_json, print_success, print_table,
    print_warning, OutputFormat,
};

/// Row for schedule tables
#[derive(Tabled)]
struct ScheduleRow {
    #[tabled(rename = "Schedule")]
    schedule_id: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Execution time")]
    execution_time: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Result")]
    result: String,
}

impl From<&ScheduleRecord> for ScheduleRow {
    fn from(record: &ScheduleRecord) -> Self {
        let result = match (&record.result, &record.cancel_reason) {
            (Some(outcome), _) => match outcome.reason {
                Some(ref reason) => format!("{}: {}", color_status(&outcome.status), reason),
                None => color_status(&outcome.status),
            },
            (None, Some(reason)) => reason.clone(),
            (None, None) if record.claimed_at.is_some() => "in flight".to_string(),
            (None, None) => "-".to_string(),
        };
        Self {
            schedule_id: record.schedule_id.clone(),
            target: record.target_size_class.clone(),
            execution_time: format_timestamp(&record.execution_time),
            state: color_status(&record.state),
            source: record.source.clone(),
            result,
        }
    }
}

/// Schedule a resize for an instance
pub async fn schedule(
    client: &ApiClient,
    request: ScheduleRequest,
    format: OutputFormat,
) -> Result<()> {
    let created = client.schedule(&request).await?;

    match format {
        OutputFormat::Json => print_json(&created)?,
        OutputFormat::Table => {
            print_success(&format!(
                "Resize of {} to {} scheduled",
                request.instance_id.cyan(),
                request.target_size_class.cyan()
            ));
            println!("Schedule ID: {}", created.schedule_id);
        }
    }

    Ok(())
}

/// Cancel the pending schedule of an instance
pub async fn cancel(client: &ApiClient, instance_id: &str, format: OutputFormat) -> Result<()> {
    let response = client.cancel(instance_id).await?;

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => match response.outcome.as_str() {
            "cancelled" => print_success(&format!(
                "Cancelled schedule {}",
                response.schedule_id.unwrap_or_default()
            )),
            "requested" => print_warning(
                "A resize is already running; cancellation applies only if it has not stopped the instance yet",
            ),
            _ => print_info(&format!("No pending schedule for {}", instance_id)),
        },
    }

    Ok(())
}

/// Show the current schedule of an instance, or its full history
pub async fn show(
    client: &ApiClient,
    instance_id: &str,
    history: bool,
    format: OutputFormat,
) -> Result<()> {
    if history {
        let records = client.history(instance_id).await?;
        match format {
            OutputFormat::Json => print_json(&records)?,
            OutputFormat::Table => {
                println!("{} {}", "Schedule history for".bold(), instance_id.cyan());
                let rows: Vec<ScheduleRow> = records.iter().map(ScheduleRow::from).collect();
                print_table(&rows);
            }
        }
        return Ok(());
    }

    let record = client.current(instance_id).await?;
    match format {
        OutputFormat::Json => print_json(&record)?,
        OutputFormat::Table => {
            println!("{} {}", "Current schedule for".bold(), instance_id.cyan());
            print_table(&[ScheduleRow::from(&record)]);
            if record.cancel_requested {
                print_warning("Cancellation requested while the resize was in flight");
            }
            println!(
                "Created {}, updated {}",
                format_timestamp(&record.created_at).dimmed(),
                format_timestamp(&record.updated_at).dimmed()
            );
        }
    }

    Ok(())
}
