use anyhow::Context;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};

use nodeguardian::crd::NodeGuardianRule;

pub async fn run(resource: String) -> anyhow::Result<()> {
    match resource.as_str() {
        "pods" => list_pods().await,
        "rules" => list_rules().await,
        other => anyhow::bail!("Unsupported resource '{other}'. Supported: pods, rules"),
    }
}

async fn list_pods() -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to connect to Kubernetes cluster. Is your kubeconfig valid?")?;

    let pods: Api<Pod> = Api::all(client);

    let pod_list = pods
        .list(&ListParams::default())
        .await
        .context("Failed to list pods. Check RBAC permissions.")?;

    let mut rows: Vec<(String, String, String, String)> = pod_list
        .into_iter()
        .map(|p| {
            let namespace = p.metadata.namespace.unwrap_or_default();
            let name = p.metadata.name.unwrap_or_default();
            let phase = p
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or("Unknown")
                .to_string();
            let node = p
                .spec
                .as_ref()
                .and_then(|s| s.node_name.as_deref())
                .unwrap_or("Not Scheduled")
                .to_string();
            (namespace, name, phase, node)
        })
        .collect();

    rows.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    println!(
        "{:<20} {:<60} {:<12} {:<15}",
        "NAMESPACE", "NAME", "STATUS", "NODE"
    );
    println!("{}", "-".repeat(107));

    for (namespace, name, phase, node) in &rows {
        println!("{:<20} {:<60} {:<12} {:<15}", namespace, name, phase, node);
    }

    println!("\nTotal: {} pods", rows.len());

    Ok(())
}

async fn list_rules() -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to connect to Kubernetes cluster. Is your kubeconfig valid?")?;

    let rules: Api<NodeGuardianRule> = Api::all(client);

    let rule_list = rules
        .list(&ListParams::default())
        .await
        .context("Failed to list NodeGuardianRule resources. Is the CRD installed?")?;

    let mut rows: Vec<(String, String, String, usize)> = rule_list
        .into_iter()
        .map(|r| {
            let name = r.metadata.name.unwrap_or_default();
            let enabled = if r.spec.metadata.enabled { "true" } else { "false" }.to_string();
            let phase = r
                .status
                .as_ref()
                .map(|s| format!("{:?}", s.phase))
                .unwrap_or_else(|| "Unknown".to_string());
            let triggered = r.status.map(|s| s.triggered_nodes.len()).unwrap_or(0);
            (name, enabled, phase, triggered)
        })
        .collect();

    rows.sort_by(|a, b| a.0.cmp(&b.0));

    println!("{:<40} {:<10} {:<10} {:<10}", "NAME", "ENABLED", "PHASE", "TRIGGERED");
    println!("{}", "-".repeat(70));

    for (name, enabled, phase, triggered) in &rows {
        println!("{:<40} {:<10} {:<10} {:<10}", name, enabled, phase, triggered);
    }

    println!("\nTotal: {} rules", rows.len());

    Ok(())
}
