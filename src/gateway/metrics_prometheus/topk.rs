use std::collections::HashMap;

use super::escape_label_value;

/// Running totals per label, of which only the `k` largest are exported as series.
///
/// True totals are kept for every label so an evicted label can be re-admitted once
/// it outgrows the smallest exported one.
#[derive(Clone, Debug)]
pub struct TopKCounter {
    k: usize,
    totals: HashMap<String, f64>,
    exported: HashMap<String, f64>,
}

impl TopKCounter {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            totals: HashMap::new(),
            exported: HashMap::new(),
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn inc(&mut self, label: &str, value: f64) {
        if label.is_empty() || !value.is_finite() || value <= 0.0 {
            return;
        }
        let total = {
            let entry = self.totals.entry(label.to_string()).or_insert(0.0);
            *entry += value;
            *entry
        };

        if let Some(series) = self.exported.get_mut(label) {
            *series = total;
            return;
        }
        if self.exported.len() < self.k {
            self.exported.insert(label.to_string(), total);
            return;
        }

        let Some((min_label, min_value)) = self
            .exported
            .iter()
            .min_by(|(a_label, a), (b_label, b)| a.total_cmp(b).then_with(|| a_label.cmp(b_label)))
            .map(|(label, value)| (label.clone(), *value))
        else {
            return;
        };
        // Ties keep the label already exported.
        if total > min_value {
            self.evict(&min_label);
            self.exported.insert(label.to_string(), total);
        }
    }

    fn evict(&mut self, label: &str) {
        self.exported.remove(label);
    }

    /// True running total, exported or not.
    pub fn get(&self, label: &str) -> f64 {
        self.totals.get(label).copied().unwrap_or(0.0)
    }

    pub fn is_exported(&self, label: &str) -> bool {
        self.exported.contains_key(label)
    }

    /// Exported series sorted by label.
    pub fn exported(&self) -> Vec<(String, f64)> {
        let mut entries: Vec<(String, f64)> = self
            .exported
            .iter()
            .map(|(label, value)| (label.clone(), *value))
            .collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));
        entries
    }

    pub fn render_gauge(&self, out: &mut String, metric: &str, help: &str, label: &str) {
        out.push_str(&format!("# HELP {metric} {help}\n"));
        out.push_str(&format!("# TYPE {metric} gauge\n"));
        for (value, total) in self.exported() {
            out.push_str(&format!(
                "{metric}{{{label}=\"{}\"}} {total}\n",
                escape_label_value(&value)
            ));
        }
    }
}
