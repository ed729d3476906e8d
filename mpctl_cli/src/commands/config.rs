use anyhow::Result;
use colored::Colorize;
use mpctl_transport::mptcp::RestoreMode;
use mpctl_transport::ControlConfig;

pub fn generate(output: &str) -> Result<()> {
    println!("{}", "Generating default configuration...".bold());

    ControlConfig::default().to_yaml_file(output)?;

    println!("{} {}", "✓ Configuration saved to:".green(), output.cyan());
    Ok(())
}

pub fn validate(file: &str) -> Result<()> {
    println!("{} {}", "Validating configuration:".bold(), file.cyan());

    match ControlConfig::from_yaml_file(file) {
        Ok(_) => {
            println!("{} Configuration is valid", "✓".green());
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            anyhow::bail!("Configuration validation failed");
        }
    }
}

pub fn show(config: &ControlConfig) -> Result<()> {
    println!("{}", "Current Configuration".bold().green());
    println!("{}", "=".repeat(50));

    println!("List buffer: {} bytes, +{} up to {}",
        config.list_buffer_min.to_string().yellow(),
        config.list_buffer_increment.to_string().yellow(),
        config.list_buffer_max.to_string().yellow());
    println!("Tuple buffer: {} bytes", config.tuple_buffer_len.to_string().yellow());
    println!("Restore mode: {}", match config.restore_mode {
        RestoreMode::Original => "original".cyan(),
        RestoreMode::NonBlocking => "non-blocking".cyan(),
    });
    println!("Default priority: {}", config.default_priority.to_string().cyan());

    Ok(())
}
