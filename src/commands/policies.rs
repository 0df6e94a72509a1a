use std::collections::BTreeMap;

use anyhow::{Context, Result};

use sdn_zerotrust::config::Config;
use sdn_zerotrust::policy::{Action, Selector};
use sdn_zerotrust::repository::{PolicyRepository, PostgresRepository};

pub async fn run() -> Result<()> {
    let config = Config::from_env()?;
    let repository = PostgresRepository::new(config.database_url);

    let mut policies = repository
        .fetch_enabled()
        .await
        .context("Failed to read policies. Is the repository reachable?")?;

    // Evaluation order: highest priority first, id as tie-break
    policies.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

    println!(
        "{:<14} {:<26} {:>8}  {:<6} {:<26} {:<26}",
        "ID", "NAME", "PRIORITY", "ACTION", "SOURCE", "DESTINATION"
    );
    println!("{}", "-".repeat(112));

    for policy in &policies {
        println!(
            "{:<14} {:<26} {:>8}  {:<6} {:<26} {:<26}",
            policy.id,
            policy.name,
            policy.priority,
            action_label(policy.action),
            selector_label(&policy.source),
            selector_label(&policy.destination),
        );
    }

    println!("\nTotal: {} enabled policies", policies.len());
    Ok(())
}

fn action_label(action: Action) -> &'static str {
    match action {
        Action::Allow => "ALLOW",
        Action::Deny => "DENY",
    }
}

fn selector_label(selector: &Selector) -> String {
    let labels = selector
        .label_selector
        .as_ref()
        .filter(|l| !l.is_empty())
        .map(format_labels);

    match (labels, selector.ip_block) {
        (Some(labels), Some(block)) => format!("{labels} + {block}"),
        (Some(labels), None) => labels,
        (None, Some(block)) => block.to_string(),
        (None, None) => "<none>".to_string(),
    }
}

fn format_labels(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(labels: &[(&str, &str)], block: Option<&str>) -> Selector {
        Selector {
            label_selector: if labels.is_empty() {
                None
            } else {
                Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                )
            },
            ip_block: block.map(|b| b.parse().unwrap()),
        }
    }

    #[test]
    fn test_selector_label_labels_only() {
        let s = selector(&[("app", "db"), ("env", "prod")], None);
        assert_eq!(selector_label(&s), "app=db,env=prod");
    }

    #[test]
    fn test_selector_label_block_only() {
        let s = selector(&[], Some("1.2.3.4/32"));
        assert_eq!(selector_label(&s), "1.2.3.4/32");
    }

    #[test]
    fn test_selector_label_both() {
        let s = selector(&[("app", "web")], Some("10.0.0.0/8"));
        assert_eq!(selector_label(&s), "app=web + 10.0.0.0/8");
    }

    #[test]
    fn test_selector_label_empty() {
        assert_eq!(selector_label(&Selector::default()), "<none>");
    }
}
