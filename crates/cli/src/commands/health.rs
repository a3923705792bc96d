//! Container health records

use anyhow::Result;
use supervisor_lib::HealthRecord;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_status, print_json, print_table, OutputFormat};

#[derive(Tabled)]
struct HealthRow {
    #[tabled(rename = "Container")]
    name: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Task")]
    task: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Failures")]
    streak: u32,
    #[tabled(rename = "Last Check")]
    last_check: String,
    #[tabled(rename = "Error")]
    error: String,
}

impl From<&HealthRecord> for HealthRow {
    fn from(record: &HealthRecord) -> Self {
        Self {
            name: record.container_name.clone(),
            id: record.container_id.chars().take(12).collect(),
            task: record.task_id.clone().unwrap_or_else(|| "-".to_string()),
            status: color_status(record.status.as_str()),
            streak: record.failing_streak,
            last_check: record
                .last_check_at
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            error: record.error.clone().unwrap_or_default(),
        }
    }
}

pub async fn show_health(client: &ApiClient, id: Option<String>, format: OutputFormat) -> Result<()> {
    let records: Vec<HealthRecord> = match id {
        Some(id) => match client.get_optional(&format!("containers/health/{id}")).await? {
            Some(record) => vec![record],
            None => anyhow::bail!("Container {id} is not monitored"),
        },
        None => client.get("containers/health").await?,
    };

    match format {
        OutputFormat::Json => print_json(&records),
        OutputFormat::Table => {
            let rows: Vec<HealthRow> = records.iter().map(HealthRow::from).collect();
            print_table(&rows, "No containers monitored");
            Ok(())
        }
    }
}
