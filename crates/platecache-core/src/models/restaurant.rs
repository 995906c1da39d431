use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::lenient;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Restaurant {
    #[serde(deserialize_with = "lenient::int_or_string")]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub neighborhood: Option<String>,
    #[serde(default)]
    pub cuisine_type: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub photograph: Option<String>,
    #[serde(default)]
    pub latlng: Option<LatLng>,
    #[serde(default)]
    pub operating_hours: BTreeMap<String, String>,
    // The API returns this as a boolean after creation but as a string once toggled
    #[serde(default, deserialize_with = "lenient::bool_or_string")]
    pub is_favorite: bool,
}

impl Restaurant {
    /// Relative URL of the restaurant's detail page
    pub fn page_url(&self) -> String {
        format!("./restaurant.html?id={}", self.id)
    }

    /// Relative URL of the restaurant's tile image
    pub fn image_url(&self) -> String {
        format!("/img/tiles/{}_1x.jpg", self.id)
    }

    pub fn image_alt(&self) -> &str {
        &self.name
    }
}

/// Cuisine and neighborhood filter. `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct RestaurantFilter {
    #[serde(default)]
    pub cuisine: Option<String>,
    #[serde(default)]
    pub neighborhood: Option<String>,
}

impl RestaurantFilter {
    /// Build a filter from UI select values, where `"all"` means no filter.
    pub fn from_selection(cuisine: &str, neighborhood: &str) -> Self {
        let pick = |v: &str| (v != "all" && !v.is_empty()).then(|| v.to_string());
        Self {
            cuisine: pick(cuisine),
            neighborhood: pick(neighborhood),
        }
    }

    pub fn matches(&self, restaurant: &Restaurant) -> bool {
        let cuisine_ok = self
            .cuisine
            .as_ref()
            .map_or(true, |c| restaurant.cuisine_type.as_ref() == Some(c));
        let neighborhood_ok = self
            .neighborhood
            .as_ref()
            .map_or(true, |n| restaurant.neighborhood.as_ref() == Some(n));
        cuisine_ok && neighborhood_ok
    }
}

/// Distinct values of a field, in first-seen order.
pub fn distinct<'a>(
    restaurants: &'a [Restaurant],
    field: impl Fn(&'a Restaurant) -> Option<&'a String>,
) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for value in restaurants.iter().filter_map(field) {
        if !seen.contains(value) {
            seen.push(value.clone());
        }
    }
    seen
}
