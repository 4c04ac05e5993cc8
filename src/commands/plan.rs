use stackup::config::StackConfig;
use stackup::dependency::Graph;

pub fn run_plan(config: &StackConfig, services: &[String], json: bool) -> anyhow::Result<()> {
    let graph = Graph::from_dependencies(&config.dependency_map())?;
    let levels = if services.is_empty() {
        graph.levels()?
    } else {
        graph.levels_for(services)?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&levels)?);
        return Ok(());
    }

    println!("\nStart plan");
    println!("==========\n");
    for (index, level) in levels.iter().enumerate() {
        println!("  Level {}:", index + 1);
        for name in level {
            let Some(def) = config.services.get(name) else {
                continue;
            };
            let port = match def.requested_port() {
                0 => String::new(),
                port => format!(" :{}", port),
            };
            let health = match def.health_check()? {
                Some(spec) => spec.target.kind().to_string(),
                None => "disabled".to_string(),
            };
            let uses = if def.uses.is_empty() {
                String::new()
            } else {
                format!(" (uses {})", def.uses.join(", "))
            };
            println!(
                "    - {} [{}, {}, health: {}]{}{}",
                name,
                def.service_type(),
                def.mode(),
                health,
                port,
                uses
            );
        }
    }
    println!();
    Ok(())
}
