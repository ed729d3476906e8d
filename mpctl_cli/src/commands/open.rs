use super::{connect, controller, print_subflows};
use anyhow::Result;
use colored::Colorize;
use mpctl_transport::mptcp::options::SubflowOption;
use mpctl_transport::mptcp::{Priority, Shutdown};
use mpctl_transport::ControlConfig;

/// Arguments of `mpctl open`
pub struct OpenRequest {
    pub connect: String,
    pub locals: Vec<String>,
    pub remote: Option<String>,
    pub low_priority: bool,
    pub tos: Option<i32>,
    pub close: bool,
    pub simulate: bool,
}

pub async fn run(request: OpenRequest, config: ControlConfig) -> Result<()> {
    println!("{}", "Multipath Subflow Control".bold().green());
    println!("{}", "=".repeat(50));
    if request.simulate {
        println!("{}", "Simulated facility".yellow());
    }

    let priority = if request.low_priority {
        Priority::Low
    } else {
        config.default_priority
    };
    let remote = request.remote.clone().unwrap_or_else(|| request.connect.clone());

    let ctl = controller(request.simulate, config)?;
    let conn = connect(&request.connect).await?;
    println!();

    let mut opened = Vec::with_capacity(request.locals.len());
    for local in &request.locals {
        match ctl.open(conn.clone(), local.as_str(), remote.as_str(), priority).await {
            Ok(id) => {
                println!(
                    "  {} Subflow {} opened: {} -> {}",
                    "✓".green(),
                    id.to_string().yellow(),
                    local,
                    remote
                );
                opened.push(id);
            }
            Err(e) if e.is_permission_denied() => {
                println!("  {} {} (binding {} needs privileges)", "✗".red(), e, local);
            }
            Err(e) => {
                println!("  {} {}", "✗".red(), e);
            }
        }
    }

    if let Some(tos) = request.tos {
        for id in &opened {
            ctl.set(conn.clone(), *id, SubflowOption::Tos, tos).await?;
            let applied = ctl.get(conn.clone(), *id, SubflowOption::Tos).await?;
            println!(
                "  {} Subflow {} IP_TOS = {}",
                "✓".green(),
                id,
                applied.to_string().yellow()
            );
        }
    }

    println!();
    println!("{}", "Subflows".bold().green());
    print_subflows(&ctl.snapshot(conn.clone()).await?);

    if request.close {
        println!();
        for id in opened {
            ctl.close(conn.clone(), id, Shutdown::Both).await?;
            println!("  {} Subflow {} closed", "✓".green(), id);
        }
        print_subflows(&ctl.snapshot(conn).await?);
    }

    Ok(())
}
