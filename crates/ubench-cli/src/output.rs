//! Plain-text tables and JSON for command output. Everything here writes
//! to stdout.

use serde::Serialize;

use ubench_core::RecipeSummary;
use ubench_state::{DiscoveryEntry, Instance, epoch_secs};

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_instances(instances: &[Instance]) {
    if instances.is_empty() {
        println!("No instances.");
        return;
    }
    let now = epoch_secs();
    println!(
        "{:<8}  {:<9}  {:<20}  {:<14}  {:<9}  {:<16}  {:<11}  {:<10}  {}",
        "ID", "KIND", "RECIPE", "SERVICE", "STATUS", "HOST", "PORTS", "JOB", "AGE"
    );
    for i in instances {
        println!(
            "{:<8}  {:<9}  {:<20}  {:<14}  {:<9}  {:<16}  {:<11}  {:<10}  {}",
            short_id(&i.id),
            i.kind,
            i.recipe_name,
            i.service_name,
            i.status,
            i.host.as_deref().unwrap_or("-"),
            join_ports(&i.ports),
            i.handle,
            format_age(now.saturating_sub(i.created_at)),
        );
    }
}

/// Detailed view of one instance.
pub fn print_instance(instance: &Instance) {
    let now = epoch_secs();
    println!("ID:       {}", instance.id);
    println!("Kind:     {}", instance.kind);
    println!("Recipe:   {}", instance.recipe_name);
    println!("Service:  {}", instance.service_name);
    println!("Status:   {}", instance.status);
    println!("Job:      {}", instance.handle);
    println!("Host:     {}", instance.host.as_deref().unwrap_or("-"));
    println!("Ports:    {}", join_ports(&instance.ports));
    println!("Age:      {}", format_age(now.saturating_sub(instance.created_at)));
    for (key, value) in &instance.metadata {
        match value.as_str() {
            Some(s) => println!("  {key}: {s}"),
            None => println!("  {key}: {value}"),
        }
    }
}

pub fn print_entries(entries: &[DiscoveryEntry]) {
    if entries.is_empty() {
        println!("No services registered.");
        return;
    }
    let now = epoch_secs();
    println!(
        "{:<20}  {:<16}  {:<11}  {:<10}  {}",
        "SERVICE", "HOST", "PORTS", "JOB", "UPDATED"
    );
    for e in entries {
        println!(
            "{:<20}  {:<16}  {:<11}  {:<10}  {} ago",
            e.service_name,
            e.host,
            join_ports(&e.ports),
            e.handle,
            format_age(now.saturating_sub(e.updated_at)),
        );
    }
}

pub fn print_recipes(recipes: &[RecipeSummary]) {
    if recipes.is_empty() {
        println!("No recipes found.");
        return;
    }
    println!("{:<24}  {:<16}  {}", "NAME", "SERVICE", "DESCRIPTION");
    for r in recipes {
        println!("{:<24}  {:<16}  {}", r.name, r.service_name, r.description);
    }
}

pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn join_ports(ports: &[u16]) -> String {
    if ports.is_empty() {
        return "-".to_string();
    }
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Coarse age: `42s`, `5m`, `3h12m`, `2d4h`.
pub fn format_age(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h{}m", s / 3600, (s % 3600) / 60),
        s => format!("{}d{}h", s / 86_400, (s % 86_400) / 3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ages_are_coarse() {
        assert_eq!(format_age(0), "0s");
        assert_eq!(format_age(59), "59s");
        assert_eq!(format_age(300), "5m");
        assert_eq!(format_age(3600 * 3 + 60 * 12 + 5), "3h12m");
        assert_eq!(format_age(86_400 * 2 + 3600 * 4), "2d4h");
    }

    #[test]
    fn short_ids() {
        assert_eq!(short_id("0123456789abcdef"), "01234567");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn ports_join() {
        assert_eq!(join_ports(&[]), "-");
        assert_eq!(join_ports(&[8000, 8001]), "8000,8001");
    }
}
