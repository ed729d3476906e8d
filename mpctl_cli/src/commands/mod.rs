pub mod config;
pub mod list;
pub mod open;

use anyhow::{Context, Result};
use colored::Colorize;
use mpctl_transport::mptcp::{
    AsyncSubflowController, MemoryPathControl, MultipathConnection, Subflow, SubflowController,
};
use mpctl_transport::ControlConfig;
use serde::Serialize;
use std::sync::Arc;
use tabled::settings::Style;
use tabled::{Table, Tabled};
use tokio::net::TcpStream;

/// One row of the subflow table
#[derive(Debug, Serialize, Tabled)]
pub struct SubflowRow {
    #[tabled(rename = "ID")]
    pub id: u8,
    #[tabled(rename = "Local")]
    pub local: String,
    #[tabled(rename = "Remote")]
    pub remote: String,
    #[tabled(rename = "Priority")]
    pub priority: String,
}

impl From<&Subflow> for SubflowRow {
    fn from(subflow: &Subflow) -> Self {
        Self {
            id: subflow.id.get(),
            local: subflow.local.to_string(),
            remote: subflow.remote.to_string(),
            priority: subflow.priority.to_string(),
        }
    }
}

pub fn controller(simulate: bool, config: ControlConfig) -> Result<AsyncSubflowController> {
    let controller = if simulate {
        let facility = MemoryPathControl::new().with_initial_subflow(true);
        SubflowController::with_config(Arc::new(facility), config)
    } else {
        SubflowController::kernel(config)?
    };
    Ok(controller.into())
}

pub async fn connect(addr: &str) -> Result<Arc<MultipathConnection<TcpStream>>> {
    println!("Connecting to {}...", addr.cyan());
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {}", addr))?;
    println!("{} Connected from {}", "✓".green(), stream.local_addr()?.to_string().cyan());
    Ok(Arc::new(MultipathConnection::new(stream)))
}

pub fn print_subflows(subflows: &[Subflow]) {
    if subflows.is_empty() {
        println!("{}", "No subflows".yellow());
        return;
    }
    let rows: Vec<SubflowRow> = subflows.iter().map(SubflowRow::from).collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{}", table);
}
