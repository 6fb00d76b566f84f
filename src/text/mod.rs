pub mod rules;
pub mod tokens;
pub mod urls;

use crate::models::{ListingDraft, ListingOrigin, ListingStatus, VehicleType};
use rules::{ExtractRule, Extraction, Field, FieldValue, Message, default_rules};
use serde::Serialize;
use std::collections::BTreeSet;

/// Best-effort fields pulled out of one free-text message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedListing {
    pub make: Option<String>,
    pub model: Option<String>,
    pub variant: Option<String>,
    pub year: Option<i32>,
    pub price: Option<i64>,
    pub km: Option<i64>,
    pub fuel: Option<String>,
    pub transmission: Option<String>,
    pub location: Option<String>,
    pub vehicle_type: VehicleType,
    pub status: ListingStatus,
    pub description: String,
    pub photos: Vec<String>,
    pub found: BTreeSet<Field>,
}

impl ParsedListing {
    /// Applies one extraction unless the field is already set. Returns whether it was kept.
    fn apply(&mut self, extraction: Extraction) -> bool {
        if self.found.contains(&extraction.field) {
            return false;
        }
        let kept = match (extraction.field, extraction.value) {
            (Field::Make, FieldValue::Text(v)) => self.make.replace(v).is_none(),
            (Field::Model, FieldValue::Text(v)) => self.model.replace(v).is_none(),
            (Field::Variant, FieldValue::Text(v)) => self.variant.replace(v).is_none(),
            (Field::Fuel, FieldValue::Text(v)) => self.fuel.replace(v).is_none(),
            (Field::Transmission, FieldValue::Text(v)) => self.transmission.replace(v).is_none(),
            (Field::Location, FieldValue::Text(v)) => self.location.replace(v).is_none(),
            (Field::Year, FieldValue::Number(n)) => match i32::try_from(n) {
                Ok(year) => self.year.replace(year).is_none(),
                Err(_) => false,
            },
            (Field::Price, FieldValue::Number(n)) => self.price.replace(n).is_none(),
            (Field::Mileage, FieldValue::Number(n)) => self.km.replace(n).is_none(),
            (Field::VehicleType, FieldValue::Type(t)) => {
                self.vehicle_type = t;
                true
            }
            (Field::Status, FieldValue::Status(s)) => {
                self.status = s;
                true
            }
            _ => false,
        };
        if kept {
            self.found.insert(extraction.field);
        }
        kept
    }

    pub fn has_make_and_model(&self) -> bool {
        self.found.contains(&Field::Make) && self.found.contains(&Field::Model)
    }

    pub fn into_draft(self, dealer_id: &str) -> ListingDraft {
        ListingDraft {
            dealer_id: dealer_id.to_string(),
            origin: ListingOrigin::Manual,
            stock_id: None,
            vehicle_type: self.vehicle_type,
            make: self.make,
            model: self.model,
            variant: self.variant,
            year: self.year,
            km: self.km,
            fuel: self.fuel,
            transmission: self.transmission,
            price: self.price,
            location: self.location,
            description: Some(self.description).filter(|d| !d.trim().is_empty()),
            photos: self.photos,
            status: self.status,
        }
    }
}

/// Runs a fixed list of extraction rules over a message and reduces their findings.
pub struct TextParser {
    rules: Vec<Box<dyn ExtractRule>>,
}

impl Default for TextParser {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

impl TextParser {
    pub fn parse(&self, message: &str, manual_photos: &str) -> ParsedListing {
        let prepared = Message::new(&urls::strip_urls(message));
        let mut parsed = ParsedListing {
            description: message.trim().to_string(),
            photos: urls::merge_photo_urls(manual_photos, message),
            ..Default::default()
        };
        for rule in &self.rules {
            for extraction in rule.extract(&prepared) {
                let field = extraction.field;
                if parsed.apply(extraction) {
                    tracing::trace!(target = "dealer_sync.text", rule = rule.name(), ?field, "field extracted");
                }
            }
        }
        parsed
    }
}

/// Parses with the default rule set.
pub fn parse_message(message: &str, manual_photos: &str) -> ParsedListing {
    TextParser::default().parse(message, manual_photos)
}
