//! Container engines available on this host

use anyhow::Result;
use serde::Serialize;
use supervisor_lib::{RuntimeDetector, RuntimeId};
use tabled::Tabled;

use crate::output::{color_status, print_json, print_table, print_warning, OutputFormat};

#[derive(Serialize)]
struct RuntimeReport {
    available: Vec<RuntimeId>,
    selected: Option<RuntimeId>,
}

#[derive(Tabled)]
struct RuntimeRow {
    #[tabled(rename = "Runtime")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Selected")]
    selected: String,
}

pub async fn show_runtimes(preferred: Option<RuntimeId>, format: OutputFormat) -> Result<()> {
    let detector = RuntimeDetector::new(preferred);
    let available = detector.available_runtimes().await;
    let selected = detector.get_best_runtime().await.ok();

    match format {
        OutputFormat::Json => print_json(&RuntimeReport { available, selected }),
        OutputFormat::Table => {
            let rows: Vec<RuntimeRow> = detector
                .candidates()
                .into_iter()
                .map(|runtime| RuntimeRow {
                    name: runtime.to_string(),
                    status: if available.contains(&runtime) {
                        color_status("ok")
                    } else {
                        color_status("unavailable")
                    },
                    selected: if selected == Some(runtime) { "*" } else { "" }.to_string(),
                })
                .collect();
            print_table(&rows, "No runtimes probed");
            if selected.is_none() {
                print_warning("No container runtime available");
            }
            Ok(())
        }
    }
}
