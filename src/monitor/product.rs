//! Resolved products and variant picking.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Purchasable variant of a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// `option1..option3` as offered by the store.
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default = "available_by_default")]
    pub available: bool,
    #[serde(default)]
    pub price: String,
}

fn available_by_default() -> bool {
    true
}

impl Variant {
    /// Options usable as a size label: options then title, skipping combined labels like `10 / Black`.
    fn labels(&self) -> impl Iterator<Item = &str> {
        self.options
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.title.as_str()))
            .filter(|o| !o.is_empty() && !o.contains(['-', '/', '\\']))
    }

    fn label(&self) -> String {
        self.labels().next().unwrap_or_default().to_string()
    }
}

/// Product resolved by a monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub title: String,
    pub handle: String,
    pub url: String,
    #[serde(default)]
    pub image: Option<String>,
    pub variants: Vec<Variant>,
}

/// Variant chosen for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pick {
    pub id: String,
    /// Size label shown in status events.
    pub size: String,
}

impl From<&Variant> for Pick {
    fn from(v: &Variant) -> Self {
        Pick {
            id: v.id.clone(),
            size: v.label(),
        }
    }
}

fn size_matches(size: &str, label: &str) -> bool {
    let size = size.trim().to_lowercase();
    let label = label.trim().to_lowercase();
    if size.chars().any(|c| c.is_ascii_digit()) {
        // shoe size: ignore any prefix like "US "
        label
            .trim_start_matches(|c: char| !c.is_ascii_digit())
            .starts_with(&size)
    } else {
        !label.chars().any(|c| c.is_ascii_digit()) && label.starts_with(&size)
    }
}

fn random<'a>(group: &[&'a Variant]) -> Option<&'a Variant> {
    if group.is_empty() {
        return None;
    }
    Some(group[rand::rng().random_range(0..group.len())])
}

/// Picks a variant for `size`.
///
/// - `random` picks any variant.
/// - Sizes with digits match by numeric prefix (`10` matches `US 10` and `10.5`).
/// - Other sizes match non-numeric labels by case-insensitive prefix.
/// - With `random_in_stock`, only available variants are considered (unless
///   none are), and an unavailable or missing match falls back to a random one.
pub fn pick_variant(variants: &[Variant], size: &str, random_in_stock: bool) -> Option<Pick> {
    let mut group: Vec<&Variant> = variants.iter().collect();
    if random_in_stock {
        let available: Vec<&Variant> = group.iter().copied().filter(|v| v.available).collect();
        if !available.is_empty() {
            group = available;
        }
    }

    if size.trim().eq_ignore_ascii_case("random") {
        return random(&group).map(Pick::from);
    }

    let matched = group
        .iter()
        .copied()
        .find(|v| v.labels().any(|label| size_matches(size, label)));

    match matched {
        Some(v) if random_in_stock && !v.available => random(&group).map(Pick::from),
        Some(v) => Some(Pick::from(v)),
        None if random_in_stock => random(&group).map(Pick::from),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(id: &str, title: &str, available: bool) -> Variant {
        Variant {
            id: id.into(),
            title: title.into(),
            options: vec![title.into()],
            available,
            price: "100.00".into(),
        }
    }

    fn shoes() -> Vec<Variant> {
        vec![
            variant("1", "US 9", true),
            variant("2", "US 10", false),
            variant("3", "10.5", true),
        ]
    }

    #[test]
    fn test_numeric_size_prefix() {
        let pick = pick_variant(&shoes(), "10", false).unwrap();
        assert_eq!(pick.id, "2");
        assert_eq!(pick.size, "US 10");
        assert_eq!(pick_variant(&shoes(), "10.5", false).unwrap().id, "3");
        assert!(pick_variant(&shoes(), "12", false).is_none());
    }

    #[test]
    fn test_random_in_stock_skips_unavailable_match() {
        for _ in 0..20 {
            let pick = pick_variant(&shoes(), "12", true).unwrap();
            assert_ne!(pick.id, "2");
        }
        // "10" still matches "10.5", the only available variant with that prefix
        assert_eq!(pick_variant(&shoes(), "10", true).unwrap().id, "3");
    }

    #[test]
    fn test_garment_sizes_ignore_numeric_labels() {
        let variants = vec![variant("a", "XL", true), variant("b", "S", true)];
        assert_eq!(pick_variant(&variants, "s", false).unwrap().id, "b");
        assert_eq!(pick_variant(&variants, "x", false).unwrap().id, "a");
        assert!(pick_variant(&shoes(), "m", false).is_none());
    }

    #[test]
    fn test_combined_labels_are_skipped() {
        let v = Variant {
            id: "1".into(),
            title: "Black / M".into(),
            options: vec!["Black".into(), "M".into()],
            available: true,
            price: String::new(),
        };
        let pick = pick_variant(std::slice::from_ref(&v), "m", false).unwrap();
        assert_eq!(pick.size, "Black");
        assert!(pick_variant(&[], "random", false).is_none());
        assert_eq!(pick_variant(&[v], "Random", false).unwrap().id, "1");
    }
}
