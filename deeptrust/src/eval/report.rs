// deeptrust/src/eval/report.rs
//
// AUC and markdown/JSON report output for the eval harness.

use super::EvalResult;

/// Exact ROC AUC from per-item (confidence, label) pairs: the probability that
/// a random fake outscores a random real item, ties counting half.
/// None when either class is missing.
pub fn auc_roc(result: &EvalResult) -> Option<f64> {
    let pos: Vec<f64> = result.scored.iter().filter(|(_, f)| *f).map(|(s, _)| *s).collect();
    let neg: Vec<f64> = result.scored.iter().filter(|(_, f)| !*f).map(|(s, _)| *s).collect();
    if pos.is_empty() || neg.is_empty() {
        return None;
    }
    let mut wins = 0.0;
    for p in &pos {
        for n in &neg {
            if p > n {
                wins += 1.0;
            } else if p == n {
                wins += 0.5;
            }
        }
    }
    Some(wins / (pos.len() * neg.len()) as f64)
}

/// Print a markdown-formatted full report to stdout.
pub fn print_markdown(result: &EvalResult) {
    let auc = auc_roc(result).map(|a| format!("{:.4}", a)).unwrap_or_else(|| "n/a".into());
    println!("# DeepTrust Evaluation Report");
    println!();
    println!(
        "**Items**: {}  **Fake**: {}  **Real**: {}  **Threshold**: {:.3}",
        result.n_items, result.n_positive, result.n_negative, result.threshold
    );
    println!(
        "**Indeterminate**: {}  **Degraded**: {}  **Errors**: {}",
        result.indeterminate,
        result.degraded,
        result.errors.values().sum::<usize>()
    );
    println!();
    println!("| Metric    | Value  |");
    println!("|-----------|--------|");
    println!("| Precision | {:.4}  |", result.global.precision());
    println!("| Recall    | {:.4}  |", result.global.recall());
    println!("| F1        | {:.4}  |", result.global.f1());
    println!("| FPR       | {:.4}  |", result.global.fpr());
    println!("| Accuracy  | {:.4}  |", result.global.accuracy());
    println!("| AUC-ROC   | {}  |", auc);
    println!();

    println!("### Per-Detector Performance\n");
    println!("| Detector   | N | P | R | F1 | FPR |");
    println!("|------------|---|---|---|----|-----|");
    for (name, m) in &result.per_detector {
        println!(
            "| {:10} | {} | {:.3} | {:.3} | {:.3} | {:.4} |",
            name.to_string(), m.total(), m.precision(), m.recall(), m.f1(), m.fpr()
        );
    }

    if !result.errors.is_empty() {
        println!("\n### Errors\n");
        for (code, n) in &result.errors {
            println!("- {}: {}", code, n);
        }
    }
}

/// Serialize the evaluation result to JSON for downstream consumption.
pub fn to_json(result: &EvalResult) -> String {
    let per_detector: serde_json::Map<String, serde_json::Value> = result
        .per_detector
        .iter()
        .map(|(name, m)| {
            (
                name.to_string(),
                serde_json::json!({
                    "precision": m.precision(),
                    "recall":    m.recall(),
                    "f1":        m.f1(),
                    "fpr":       m.fpr(),
                }),
            )
        })
        .collect();
    serde_json::json!({
        "n_items":       result.n_items,
        "n_positive":    result.n_positive,
        "n_negative":    result.n_negative,
        "threshold":     result.threshold,
        "precision":     result.global.precision(),
        "recall":        result.global.recall(),
        "f1":            result.global.f1(),
        "fpr":           result.global.fpr(),
        "accuracy":      result.global.accuracy(),
        "auc_roc":       auc_roc(result),
        "indeterminate": result.indeterminate,
        "degraded":      result.degraded,
        "errors":        result.errors,
        "per_detector":  per_detector,
    })
    .to_string()
}
