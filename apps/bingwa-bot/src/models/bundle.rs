use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validity {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Validity {
    pub const ALL: [Validity; 4] = [
        Validity::Hourly,
        Validity::Daily,
        Validity::Weekly,
        Validity::Monthly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Validity::Hourly => "hourly",
            Validity::Daily => "daily",
            Validity::Weekly => "weekly",
            Validity::Monthly => "monthly",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Validity::Hourly => "⏱ Hourly Deals",
            Validity::Daily => "📅 Daily Deals",
            Validity::Weekly => "🗓 Weekly Deals",
            Validity::Monthly => "📆 Monthly Deals",
        }
    }
}

impl fmt::Display for Validity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Validity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Validity::Hourly),
            "daily" => Ok(Validity::Daily),
            "weekly" => Ok(Validity::Weekly),
            "monthly" => Ok(Validity::Monthly),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    pub id: String,
    pub display_name: String,
    /// Whole Kenyan shillings.
    pub price: u32,
    pub validity: Validity,
    pub data_allowance: String,
    pub validity_label: String,
    #[serde(default)]
    pub description: String,
}

impl Bundle {
    fn new(
        id: &str,
        display_name: &str,
        price: u32,
        validity: Validity,
        data_allowance: &str,
        validity_label: &str,
        description: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            price,
            validity,
            data_allowance: data_allowance.to_string(),
            validity_label: validity_label.to_string(),
            description: description.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    bundles: Vec<Bundle>,
}

/// Read-only after construction; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Catalog {
    bundles: BTreeMap<String, Bundle>,
}

impl Catalog {
    pub fn from_bundles(bundles: Vec<Bundle>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for bundle in bundles {
            if bundle.price == 0 {
                anyhow::bail!("bundle {} has a zero price", bundle.id);
            }
            let id = bundle.id.clone();
            if map.insert(id.clone(), bundle).is_some() {
                anyhow::bail!("duplicate bundle id {}", id);
            }
        }
        Ok(Self { bundles: map })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        let file: CatalogFile = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse catalog {}", path.display()))?;
        Self::from_bundles(file.bundles)
    }

    pub fn get(&self, id: &str) -> Option<&Bundle> {
        self.bundles.get(id)
    }

    /// Bundles of one validity period, cheapest first.
    pub fn in_category(&self, validity: Validity) -> Vec<&Bundle> {
        let mut items: Vec<&Bundle> = self
            .bundles
            .values()
            .filter(|b| b.validity == validity)
            .collect();
        items.sort_by(|a, b| a.price.cmp(&b.price).then_with(|| a.id.cmp(&b.id)));
        items
    }

    /// Categories that have at least one bundle, in period order.
    pub fn categories(&self) -> Vec<Validity> {
        Validity::ALL
            .into_iter()
            .filter(|v| self.bundles.values().any(|b| b.validity == *v))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        use Validity::*;
        let bundles = vec![
            Bundle::new("H1", "1GB for 1hr @ Ksh 19", 19, Hourly, "1GB", "1 Hour", "Hourly data bundle"),
            Bundle::new("H2", "1GB for 1hr @ Ksh 20", 20, Hourly, "1GB", "1 Hour", "Hourly data bundle"),
            Bundle::new("H3", "Internet access for 3hrs @ Ksh 49", 49, Hourly, "Unlimited", "3 Hours", "Hourly access bundle"),
            Bundle::new("H4", "1.5GB for 3hrs @ Ksh 50", 50, Hourly, "1.5GB", "3 Hours", "Hourly data bundle"),
            Bundle::new("D1", "100MB for 24hrs @ Ksh 20", 20, Daily, "100MB", "24 Hours", "Daily data bundle"),
            Bundle::new("D2", "250MB for 24hrs @ Ksh 18", 18, Daily, "250MB", "24 Hours", "Daily data bundle"),
            Bundle::new("D3", "1.25GB till midnight @ Ksh 55", 55, Daily, "1.25GB", "Until midnight", "Same day data bundle"),
            Bundle::new("D4", "1GB for 24hrs @ Ksh 95", 95, Daily, "1GB", "24 Hours", "Daily data bundle"),
            Bundle::new("D5", "2GB for 24hrs @ Ksh 100", 100, Daily, "2GB", "24 Hours", "Daily data bundle"),
            Bundle::new("W1", "350MB for 7 days @ Ksh 47", 47, Weekly, "350MB", "7 Days", "Weekly data bundle"),
            Bundle::new("M1", "1.2GB for 30days @ Ksh 250", 250, Monthly, "1.2GB", "30 Days", "Monthly data bundle"),
        ];
        Self {
            bundles: bundles.into_iter().map(|b| (b.id.clone(), b)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_catalog_groups_by_validity() {
        let catalog = Catalog::default();
        assert_eq!(catalog.categories(), Validity::ALL.to_vec());

        let daily = catalog.in_category(Validity::Daily);
        assert!(daily.iter().all(|b| b.validity == Validity::Daily));
        let ids: Vec<&str> = daily.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, ["D2", "D1", "D3", "D4", "D5"]);

        let d1 = catalog.get("D1").unwrap();
        assert_eq!(d1.price, 20);
        assert_eq!(d1.data_allowance, "100MB");

        let d2 = catalog.get("D2").unwrap();
        assert_eq!(d2.price, 18);
        assert_eq!(d2.display_name, "250MB for 24hrs @ Ksh 18");
    }

    #[test]
    fn validity_round_trips_through_callback_names() {
        for v in Validity::ALL {
            assert_eq!(v.as_str().parse::<Validity>(), Ok(v));
        }
        assert!("yearly".parse::<Validity>().is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let b = Catalog::default().get("D1").cloned().unwrap();
        assert!(Catalog::from_bundles(vec![b.clone(), b]).is_err());
    }

    #[test]
    fn catalog_loads_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[bundles]]
id = "X1"
display_name = "5GB for 7 days @ Ksh 300"
price = 300
validity = "weekly"
data_allowance = "5GB"
validity_label = "7 Days"
"#
        )
        .unwrap();

        let catalog = Catalog::load(file.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.categories(), vec![Validity::Weekly]);
        assert_eq!(catalog.get("X1").unwrap().description, "");
    }
}
