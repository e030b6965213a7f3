//! Dry-run commands: `conductor plan` and `conductor routes`.

use anyhow::Result;
use conductor::config::ConductorConfig;

use super::build_engine;

pub fn cmd_plan(config: &ConductorConfig, topic: &str) -> Result<()> {
    let engine = build_engine(config);
    let (plan, params) = engine.plan_for(topic)?;

    println!("Topic: {}", topic);
    if !params.is_empty() {
        println!();
        println!("Parameters:");
        for (name, value) in &params {
            println!("  {} = {}", name, value);
        }
    }
    println!();
    println!("Plan:");
    for line in plan.to_string().lines() {
        println!("  {}", line);
    }
    if let Some(timeout) = plan.max_timeout() {
        println!();
        println!("Deadline: {}ms", timeout.as_millis());
    }
    Ok(())
}

pub fn cmd_routes(config: &ConductorConfig) -> Result<()> {
    let engine = build_engine(config);
    let routes = engine.routes();

    if routes.is_empty() {
        println!("No routes registered.");
        println!("Declare [[actions]] in conductor.toml to add some.");
        return Ok(());
    }

    for (pattern, actions) in routes {
        let names: Vec<String> = actions.iter().map(ToString::to_string).collect();
        println!("{}  ->  {}", pattern, names.join(", "));
    }
    Ok(())
}
