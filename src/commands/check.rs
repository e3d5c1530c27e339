use k8s_openapi::api::core::v1::Node;
use kube::api::ListParams;
use kube::{Api, Client};

use nodeguardian::crd::NodeGuardianRule;

pub async fn run(config_path: &str) -> anyhow::Result<()> {
    println!("Running cluster connectivity checks...\n");

    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    };

    print!("  List nodes permission ........ ");
    let nodes: Api<Node> = Api::all(client.clone());
    match nodes.list(&ListParams::default()).await {
        Ok(node_list) => println!("OK ({} nodes)", node_list.items.len()),
        Err(e) => println!("FAIL ({})", e),
    }

    print!("  Config file .................. ");
    let config = match nodeguardian::config::EngineConfig::from_file(config_path) {
        Ok(c) => {
            println!("OK ({})", config_path);
            Some(c)
        }
        Err(e) => {
            println!("FAIL ({})", e);
            None
        }
    };
    if let Some(config) = &config {
        println!(
            "    max concurrent checks: {}, default channels: {:?}",
            config.monitoring.max_concurrent_checks, config.alert.default_channels
        );
    }

    println!("\nValidating NodeGuardianRule resources...\n");
    let rules: Api<NodeGuardianRule> = Api::all(client);
    let rule_list = match rules.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(e) => {
            println!("  Could not list rules ({e}). Is the CRD installed? Run `nodeguardian crd install`.");
            return Ok(());
        }
    };

    let mut pass = 0;
    let mut fail = 0;
    for rule in &rule_list {
        let name = rule.metadata.name.clone().unwrap_or_else(|| "<unnamed>".to_string());
        print!("  {:<40} ", name);
        match validate_rule(rule) {
            Ok(()) => {
                println!("OK");
                pass += 1;
            }
            Err(reason) => {
                println!("FAIL ({reason})");
                fail += 1;
            }
        }
    }

    println!("\n{pass} passed, {fail} failed, {} total", pass + fail);
    Ok(())
}

fn validate_rule(rule: &NodeGuardianRule) -> Result<(), String> {
    nodeguardian::crd::validate_rule_spec(&rule.spec).map_err(|e| e.to_string())
}
