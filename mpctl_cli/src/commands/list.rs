use super::{connect, controller, print_subflows, SubflowRow};
use anyhow::Result;
use colored::Colorize;
use mpctl_transport::ControlConfig;

pub async fn run(addr: &str, json: bool, simulate: bool, config: ControlConfig) -> Result<()> {
    let ctl = controller(simulate, config)?;
    let conn = connect(addr).await?;

    let subflows = ctl.snapshot(conn).await?;

    if json {
        let rows: Vec<SubflowRow> = subflows.iter().map(SubflowRow::from).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!();
        println!("{}", "Subflows".bold().green());
        print_subflows(&subflows);
    }

    Ok(())
}
