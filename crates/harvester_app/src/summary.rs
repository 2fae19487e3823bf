use harvester_core::RunReport;
use harvester_engine::StatusReport;

pub fn print_report(report: &RunReport) {
    println!();
    println!("Harvest summary");
    println!("  units:      {}", report.total);
    println!("  completed:  {}", report.completed);
    println!("  failed:     {}", report.failed);
    println!("  remaining:  {}", report.remaining);
    println!("  items:      {}", report.items_collected);
    if !report.failures.is_empty() {
        println!("Failed units:");
        for failure in &report.failures {
            println!(
                "  {} after {} attempt(s): {}",
                failure.unit_id,
                failure.attempts,
                failure.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    if report.failed > 0 || report.remaining > 0 {
        println!("Run again to retry the units that did not complete.");
    }
}

pub fn print_status(status: &StatusReport) {
    match status.last_updated {
        Some(when) => println!("Progress last saved {}", when.to_rfc3339()),
        None => println!("No saved progress"),
    }
    let plan = &status.plan;
    println!(
        "Next run: {} to skip, {} to retry, {} to attempt",
        plan.skip.len(),
        plan.retry.len(),
        plan.attempt.len()
    );
    for (label, ids) in [
        ("skip", &plan.skip),
        ("retry", &plan.retry),
        ("attempt", &plan.attempt),
    ] {
        if !ids.is_empty() {
            println!("  {label:<8} {}", ids.join(", "));
        }
    }
    print_report(&status.report);
}
