//! Command implementations

use anyhow::Result;
use colored::Colorize;
use rknn_convert::errors::Warning;
use rknn_convert::pipeline;
use std::path::Path;

fn print_warnings(warnings: &[Warning]) {
    for warning in warnings {
        println!("{} {warning}", "⚠".yellow());
    }
    if !warnings.is_empty() {
        println!();
    }
}

pub fn convert(config_path: &str) -> Result<()> {
    println!("📦 Converting per {}", config_path.bold());
    println!();

    let outcome = pipeline::convert(Path::new(config_path))?;

    print_warnings(&outcome.warnings);
    println!("✓ Conversion complete");
    println!("  Nodes:   {}", outcome.node_count);
    println!(
        "  Mode:    {}",
        if outcome.quantized { "quantized" } else { "float32" }
    );
    println!("  Output:  {}", outcome.output.display().to_string().cyan());
    Ok(())
}

pub fn explain(config_path: &str) -> Result<()> {
    println!("📊 Model structure per {}", config_path.bold());
    println!();

    let explanation = pipeline::explain(Path::new(config_path))?;

    print_warnings(&explanation.warnings);
    print!("{}", explanation.config_summary);
    print!("{}", explanation.report.render());
    Ok(())
}
