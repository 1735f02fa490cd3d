use serde_json::Value;

/// Aligned table of instances: id, name, type, status, health, hash prefix.
pub fn print_instances(instances: &Value) {
    let Some(rows) = instances.as_array() else {
        println!("(no instances)");
        return;
    };
    if rows.is_empty() {
        println!("(no instances)");
        return;
    }

    println!(
        "{:<28} {:<16} {:<14} {:<12} {:<10} {}",
        "ID", "NAME", "TYPE", "STATUS", "HEALTH", "CONFIG"
    );
    for row in rows {
        let hash = row["configHash"]
            .as_str()
            .map(|h| &h[..12.min(h.len())])
            .unwrap_or("-");
        println!(
            "{:<28} {:<16} {:<14} {:<12} {:<10} {}",
            row["id"].as_str().unwrap_or("?"),
            row["name"].as_str().unwrap_or("?"),
            row["deploymentType"].as_str().unwrap_or("?"),
            row["status"].as_str().unwrap_or("?"),
            row["health"].as_str().unwrap_or("?"),
            hash,
        );
    }
}

pub fn print_status(status: &Value) {
    println!("Instances: {}", status["instances"].as_u64().unwrap_or(0));
    if let Some(by_status) = status["byStatus"].as_object() {
        for (status, count) in by_status {
            println!("  {:<12} {}", status, count);
        }
    }
    if let Some(by_health) = status["byHealth"].as_object() {
        println!("Health:");
        for (health, count) in by_health {
            println!("  {:<12} {}", health, count);
        }
    }
}

pub fn print_reconcile_result(result: &Value) {
    let success = result["success"].as_bool().unwrap_or(false);
    let marker = if success { "ok" } else { "FAILED" };
    println!(
        "[{}] {} ({} ms)",
        marker,
        result["message"].as_str().unwrap_or(""),
        result["durationMs"].as_u64().unwrap_or(0),
    );
    for change in result["changes"].as_array().cloned().unwrap_or_default() {
        if let Some(change) = change.as_str() {
            println!("  - {}", change);
        }
    }
}

pub fn print_drift_reports(reports: &[Value]) {
    if reports.is_empty() {
        println!("(no instances scanned)");
        return;
    }
    for report in reports {
        let id = report["instanceId"].as_str().unwrap_or("?");
        let health = report["health"].as_str().unwrap_or("?");
        let findings = report["findings"].as_array().cloned().unwrap_or_default();
        if findings.is_empty() {
            println!("{}: {} (no findings)", id, health);
            continue;
        }
        println!("{}: {} ({} findings)", id, health, findings.len());
        for finding in findings {
            println!(
                "  [{}] {}: {}",
                finding["severity"].as_str().unwrap_or("?"),
                finding["field"].as_str().unwrap_or("?"),
                finding["message"].as_str().unwrap_or(""),
            );
        }
    }
}

pub fn print_doctor_checks(body: &Value) {
    for check in body["checks"].as_array().cloned().unwrap_or_default() {
        let passed = check["passed"].as_bool().unwrap_or(false);
        println!(
            "[{}] {:<16} {}",
            if passed { "pass" } else { "FAIL" },
            check["name"].as_str().unwrap_or("?"),
            check["message"].as_str().unwrap_or(""),
        );
    }
}

pub fn print_events(events: &Value) {
    for event in events.as_array().cloned().unwrap_or_default() {
        println!(
            "{} {:<24} {}",
            event["at"].as_str().unwrap_or("?"),
            event["kind"].as_str().unwrap_or("?"),
            event["instance_id"]
                .as_str()
                .or_else(|| event["instanceId"].as_str())
                .unwrap_or(""),
        );
    }
}
