use darwinflow::host::Host;

pub fn list(host: &Host) -> anyhow::Result<i32> {
    let registry = host.registry();
    let plugins = registry.plugins();
    if plugins.is_empty() {
        println!("No plugins loaded.");
        return Ok(0);
    }
    for info in plugins {
        let caps = registry
            .capabilities(&info.name)
            .map(|c| c.iter().collect::<Vec<_>>().join(", "))
            .unwrap_or_default();
        let core = if info.is_core { " (core)" } else { "" };
        println!("{} {}{}  [{}]", info.name, info.version, core, caps);
        if !info.description.is_empty() {
            println!("    {}", info.description);
        }
    }
    Ok(0)
}

pub fn types(host: &Host) -> anyhow::Result<i32> {
    for (plugin, ty) in host.registry().entity_types() {
        let name = if ty.display_name.is_empty() { &ty.entity_type } else { &ty.display_name };
        println!("{:<16} {:<20} {}", ty.entity_type, name, plugin);
    }
    Ok(0)
}
