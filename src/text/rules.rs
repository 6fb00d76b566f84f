use super::tokens::{Token, tokenize};
use crate::models::{ListingStatus, VehicleType};
use crate::normalize::coerce_year;
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// A message prepared for extraction: link-free text plus its tokens.
#[derive(Debug, Clone)]
pub struct Message {
    pub text: String,
    pub tokens: Vec<Token>,
}

impl Message {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            tokens: tokenize(text),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Make,
    Model,
    Variant,
    Year,
    Price,
    Mileage,
    Fuel,
    Transmission,
    Location,
    VehicleType,
    Status,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(i64),
    Type(VehicleType),
    Status(ListingStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub field: Field,
    pub value: FieldValue,
}

impl Extraction {
    fn text(field: Field, value: impl Into<String>) -> Self {
        Self {
            field,
            value: FieldValue::Text(value.into()),
        }
    }

    fn number(field: Field, value: i64) -> Self {
        Self {
            field,
            value: FieldValue::Number(value),
        }
    }
}

/// One heuristic that looks for one kind of fact in a message.
///
/// Rules never fail; finding nothing is an empty result.
pub trait ExtractRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, message: &Message) -> Vec<Extraction>;
}

/// Rules in precedence order: earlier rules win when two report the same field.
pub fn default_rules() -> Vec<Box<dyn ExtractRule>> {
    vec![
        Box::new(LabelRule),
        Box::new(MakeModelRule),
        Box::new(YearRule),
        Box::new(PriceRule),
        Box::new(MileageRule),
        Box::new(FuelRule),
        Box::new(TransmissionRule),
        Box::new(LocationRule),
        Box::new(VehicleTypeRule),
        Box::new(StatusRule),
    ]
}

const MAKES: &[(&str, &str)] = &[
    ("maruti suzuki", "Maruti Suzuki"),
    ("maruti", "Maruti Suzuki"),
    ("suzuki", "Maruti Suzuki"),
    ("hyundai", "Hyundai"),
    ("honda", "Honda"),
    ("tata", "Tata"),
    ("mahindra", "Mahindra"),
    ("toyota", "Toyota"),
    ("kia", "Kia"),
    ("mg", "MG"),
    ("renault", "Renault"),
    ("nissan", "Nissan"),
    ("ford", "Ford"),
    ("volkswagen", "Volkswagen"),
    ("vw", "Volkswagen"),
    ("skoda", "Skoda"),
    ("jeep", "Jeep"),
    ("bmw", "BMW"),
    ("mercedes-benz", "Mercedes-Benz"),
    ("mercedes benz", "Mercedes-Benz"),
    ("mercedes", "Mercedes-Benz"),
    ("benz", "Mercedes-Benz"),
    ("audi", "Audi"),
    ("volvo", "Volvo"),
    ("jaguar", "Jaguar"),
    ("land rover", "Land Rover"),
    ("lexus", "Lexus"),
    ("porsche", "Porsche"),
    ("fiat", "Fiat"),
    ("chevrolet", "Chevrolet"),
    ("datsun", "Datsun"),
    ("citroen", "Citroen"),
    ("isuzu", "Isuzu"),
    ("byd", "BYD"),
    ("tesla", "Tesla"),
];

const CITIES: &[(&str, &str)] = &[
    ("new delhi", "New Delhi"),
    ("navi mumbai", "Navi Mumbai"),
    ("delhi", "Delhi"),
    ("mumbai", "Mumbai"),
    ("bangalore", "Bengaluru"),
    ("bengaluru", "Bengaluru"),
    ("chennai", "Chennai"),
    ("hyderabad", "Hyderabad"),
    ("pune", "Pune"),
    ("kolkata", "Kolkata"),
    ("ahmedabad", "Ahmedabad"),
    ("jaipur", "Jaipur"),
    ("lucknow", "Lucknow"),
    ("chandigarh", "Chandigarh"),
    ("gurgaon", "Gurugram"),
    ("gurugram", "Gurugram"),
    ("noida", "Noida"),
    ("kochi", "Kochi"),
    ("indore", "Indore"),
    ("bhopal", "Bhopal"),
    ("nagpur", "Nagpur"),
    ("surat", "Surat"),
    ("coimbatore", "Coimbatore"),
    ("thane", "Thane"),
];

const FUELS: &[(&str, &str)] = &[
    ("petrol", "petrol"),
    ("gasoline", "petrol"),
    ("diesel", "diesel"),
    ("cng", "cng"),
    ("lpg", "lpg"),
    ("electric", "electric"),
    ("ev", "electric"),
    ("hybrid", "hybrid"),
];

const TRANSMISSIONS: &[(&str, &str)] = &[
    ("manual", "manual"),
    ("mt", "manual"),
    ("automatic", "automatic"),
    ("auto", "automatic"),
    ("amt", "automatic"),
    ("cvt", "automatic"),
    ("dct", "automatic"),
    ("dsg", "automatic"),
];

const DISTANCE_UNITS: &[&str] = &["km", "kms", "kilometer", "kilometers", "kilometre", "kilometres"];
const PRICE_UNITS: &[&str] = &["lakh", "lakhs", "lac", "lacs", "l", "cr", "crore", "crores", "k"];
const CURRENCY_WORDS: &[&str] = &["₹", "rs", "rs.", "inr", "price", "priced", "asking", "@", "expected"];

const STOPWORDS: &[&str] = &[
    "for", "sale", "selling", "sell", "urgent", "in", "at", "with", "and", "only", "driven",
    "model", "year", "owner", "1st", "2nd", "first", "second", "single", "new", "used", "brand",
    "available", "sold", "contact", "call", "negotiable", "fixed", "condition", "excellent",
    "good", "mint", "-", "white", "black", "red", "silver", "grey", "gray", "blue",
];

static AMOUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:₹|rs\.?|inr)?(\d[\d,]*(?:\.\d+)?)(lakhs?|lacs?|l|cr|crores?|k)?$")
        .expect("amount pattern compiles")
});

static DISTANCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d[\d,]*(?:\.\d+)?)(k)?(kms?|kilomet(?:er|re)s?)?$")
        .expect("distance pattern compiles")
});

static YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:19|20)\d{2}$").expect("year pattern compiles"));

static LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)^\s*(make|brand|model|variant|trim|year|price|kms?|mileage|odometer|fuel|transmission|gearbox|location|city)\s*[:=]\s*(.+?)\s*$",
    )
    .expect("label pattern compiles")
});

fn lookup(table: &[(&str, &'static str)], key: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| *canonical)
}

/// Longest dictionary phrase (one or two tokens) starting at `start`.
fn phrase_at(
    tokens: &[Token],
    start: usize,
    table: &[(&str, &'static str)],
) -> Option<(&'static str, usize)> {
    if let (Some(a), Some(b)) = (tokens.get(start), tokens.get(start + 1)) {
        let pair = format!("{} {}", a.lower, b.lower);
        if let Some(found) = lookup(table, &pair) {
            return Some((found, 2));
        }
    }
    tokens
        .get(start)
        .and_then(|t| lookup(table, &t.lower))
        .map(|found| (found, 1))
}

fn is_distance_unit(token: Option<&Token>) -> bool {
    token.is_some_and(|t| t.is_any(DISTANCE_UNITS))
}

fn plain_number(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse::<f64>().ok().filter(|v| v.is_finite())
}

fn price_multiplier(unit: &str) -> f64 {
    match unit {
        "lakh" | "lakhs" | "lac" | "lacs" | "l" => 100_000.0,
        "cr" | "crore" | "crores" => 10_000_000.0,
        "k" => 1_000.0,
        _ => 1.0,
    }
}

/// Word that can name a model or variant.
fn is_descriptor(token: &Token) -> bool {
    token.has_letter()
        && !token.lower.starts_with('₹')
        && !token.is_any(STOPWORDS)
        && !token.is_any(DISTANCE_UNITS)
        && !token.is_any(PRICE_UNITS)
        && !token.is_any(CURRENCY_WORDS)
        && lookup(FUELS, &token.lower).is_none()
        && lookup(TRANSMISSIONS, &token.lower).is_none()
        && lookup(CITIES, &token.lower).is_none()
        && lookup(MAKES, &token.lower).is_none()
        && DISTANCE_RE.captures(&token.lower).is_none()
        && AMOUNT_RE.captures(&token.lower).is_none()
}

fn display(token: &Token) -> String {
    if token.text.chars().any(char::is_uppercase) {
        return token.text.clone();
    }
    let mut chars = token.text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Parses a stated price such as `4.5 lakh`, `₹4,50,000` or `7L`.
pub fn parse_amount(raw: &str) -> Option<i64> {
    let tokens = tokenize(raw);
    PriceRule::scan(&tokens, true)
}

/// `make: Hyundai`, `price = 4.5 lakh` style lines.
pub struct LabelRule;

impl ExtractRule for LabelRule {
    fn name(&self) -> &'static str {
        "label"
    }

    fn extract(&self, message: &Message) -> Vec<Extraction> {
        let mut out = Vec::new();
        for caps in LABEL_RE.captures_iter(&message.text) {
            let (Some(key), Some(value)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let key = key.as_str().to_ascii_lowercase();
            let value = value.as_str().trim();
            let lower = value.to_lowercase();
            let extraction = match key.as_str() {
                "make" | "brand" => Some(Extraction::text(
                    Field::Make,
                    lookup(MAKES, &lower).map(str::to_string).unwrap_or_else(|| value.to_string()),
                )),
                "model" => Some(Extraction::text(Field::Model, value)),
                "variant" | "trim" => Some(Extraction::text(Field::Variant, value)),
                "year" => coerce_year(value).map(|y| Extraction::number(Field::Year, i64::from(y))),
                "price" => parse_amount(value).map(|p| Extraction::number(Field::Price, p)),
                "km" | "kms" | "mileage" | "odometer" => MileageRule::scan(&tokenize(value), true)
                    .map(|km| Extraction::number(Field::Mileage, km)),
                "fuel" => Some(Extraction::text(
                    Field::Fuel,
                    lookup(FUELS, &lower).map(str::to_string).unwrap_or(lower),
                )),
                "transmission" | "gearbox" => Some(Extraction::text(
                    Field::Transmission,
                    lookup(TRANSMISSIONS, &lower).map(str::to_string).unwrap_or(lower),
                )),
                "location" | "city" => Some(Extraction::text(
                    Field::Location,
                    lookup(CITIES, &lower).map(str::to_string).unwrap_or_else(|| value.to_string()),
                )),
                _ => None,
            };
            out.extend(extraction.filter(|e| match &e.value {
                FieldValue::Text(t) => !t.is_empty(),
                _ => true,
            }));
        }
        out
    }
}

/// Known make, then the model and an optional variant that follow it.
pub struct MakeModelRule;

impl ExtractRule for MakeModelRule {
    fn name(&self) -> &'static str {
        "make_model"
    }

    fn extract(&self, message: &Message) -> Vec<Extraction> {
        let tokens = &message.tokens;
        let Some((start, make, width)) = (0..tokens.len())
            .find_map(|i| phrase_at(tokens, i, MAKES).map(|(make, width)| (i, make, width)))
        else {
            return Vec::new();
        };
        let mut out = vec![Extraction::text(Field::Make, make)];

        let mut cursor = start + width;
        let model = match (tokens.get(cursor), tokens.get(cursor + 1)) {
            (Some(num), Some(series))
                if num.number().is_some()
                    && num.text.len() <= 3
                    && series.is_any(&["series", "class"]) =>
            {
                cursor += 2;
                Some(format!("{} {}", num.text, display(series)))
            }
            (Some(token), _) if is_descriptor(token) => {
                cursor += 1;
                Some(display(token))
            }
            _ => None,
        };
        let Some(model) = model else {
            return out;
        };
        out.push(Extraction::text(Field::Model, model));

        let mut variant: Vec<&str> = Vec::new();
        if let Some(first) = tokens.get(cursor).filter(|t| is_descriptor(t) && t.text.len() <= 12) {
            variant.push(&first.text);
            let qualifies = |t: &&Token| {
                is_descriptor(t)
                    && t.text.len() <= 12
                    && (t.text.chars().any(|c| c.is_ascii_digit())
                        || (t.text.len() >= 2 && t.text == t.text.to_uppercase()))
            };
            if let Some(second) = tokens.get(cursor + 1).filter(qualifies) {
                variant.push(&second.text);
            }
        }
        if !variant.is_empty() {
            out.push(Extraction::text(Field::Variant, variant.join(" ")));
        }
        out
    }
}

/// A four digit model year that is not an odometer reading.
pub struct YearRule;

impl ExtractRule for YearRule {
    fn name(&self) -> &'static str {
        "year"
    }

    fn extract(&self, message: &Message) -> Vec<Extraction> {
        let tokens = &message.tokens;
        let latest = i64::from(Utc::now().year()) + 1;
        tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| YEAR_RE.is_match(&t.lower))
            .filter(|(i, _)| !is_distance_unit(tokens.get(i + 1)))
            .filter(|(i, _)| {
                !i.checked_sub(1)
                    .and_then(|p| tokens.get(p))
                    .is_some_and(|prev| prev.is_any(CURRENCY_WORDS))
            })
            .filter_map(|(_, t)| t.lower.parse::<i64>().ok())
            .find(|y| (1980..=latest).contains(y))
            .map(|y| vec![Extraction::number(Field::Year, y)])
            .unwrap_or_default()
    }
}

/// Amounts carrying a currency marker or an Indian numbering unit.
pub struct PriceRule;

impl PriceRule {
    /// `assume_currency` treats bare numbers as prices (used for labelled values).
    fn scan(tokens: &[Token], assume_currency: bool) -> Option<i64> {
        for (i, token) in tokens.iter().enumerate() {
            let Some(caps) = AMOUNT_RE.captures(&token.lower) else {
                continue;
            };
            let Some(base) = caps.get(1).and_then(|m| plain_number(m.as_str())) else {
                continue;
            };
            let glued_currency = token.lower.starts_with('₹')
                || token.lower.starts_with("rs")
                || token.lower.starts_with("inr");
            let prev_currency = i
                .checked_sub(1)
                .and_then(|p| tokens.get(p))
                .is_some_and(|prev| prev.is_any(CURRENCY_WORDS));
            let currency = assume_currency || glued_currency || prev_currency;

            let (unit, next) = match caps.get(2) {
                Some(unit) => (Some(unit.as_str().to_string()), i + 1),
                None => match tokens.get(i + 1).filter(|t| t.is_any(PRICE_UNITS)) {
                    Some(unit) => (Some(unit.lower.clone()), i + 2),
                    None => (None, i + 1),
                },
            };
            if is_distance_unit(tokens.get(next)) {
                continue;
            }
            let value = match unit.as_deref() {
                Some("k") if !currency => continue,
                Some(unit) => base * price_multiplier(unit),
                None if !currency => continue,
                // "price 4.5" is shorthand for lakh
                None if base < 100.0 => base * 100_000.0,
                None => base,
            };
            if value >= 1.0 && value < 1e13 {
                return Some(value.round() as i64);
            }
        }
        None
    }
}

impl ExtractRule for PriceRule {
    fn name(&self) -> &'static str {
        "price"
    }

    fn extract(&self, message: &Message) -> Vec<Extraction> {
        Self::scan(&message.tokens, false)
            .map(|p| vec![Extraction::number(Field::Price, p)])
            .unwrap_or_default()
    }
}

/// Odometer readings: `45000 km`, `45k kms`, `45000km`, `driven 45000`.
pub struct MileageRule;

impl MileageRule {
    fn scan(tokens: &[Token], assume_distance: bool) -> Option<i64> {
        for (i, token) in tokens.iter().enumerate() {
            let Some(caps) = DISTANCE_RE.captures(&token.lower) else {
                continue;
            };
            let Some(base) = caps.get(1).and_then(|m| plain_number(m.as_str())) else {
                continue;
            };
            let glued_unit = caps.get(3).is_some();
            let after_driven = i
                .checked_sub(1)
                .and_then(|p| tokens.get(p))
                .is_some_and(|prev| prev.is_any(&["driven", "odometer", "odo", "run"]));
            if !(assume_distance
                || glued_unit
                || after_driven
                || is_distance_unit(tokens.get(i + 1)))
            {
                continue;
            }
            let factor = if caps.get(2).is_some() { 1_000.0 } else { 1.0 };
            let value = base * factor;
            if value < 1e9 {
                return Some(value.round() as i64);
            }
        }
        None
    }
}

impl ExtractRule for MileageRule {
    fn name(&self) -> &'static str {
        "mileage"
    }

    fn extract(&self, message: &Message) -> Vec<Extraction> {
        Self::scan(&message.tokens, false)
            .map(|km| vec![Extraction::number(Field::Mileage, km)])
            .unwrap_or_default()
    }
}

fn first_lookup(message: &Message, table: &[(&str, &'static str)], field: Field) -> Vec<Extraction> {
    message
        .tokens
        .iter()
        .find_map(|t| lookup(table, &t.lower))
        .map(|v| vec![Extraction::text(field, v)])
        .unwrap_or_default()
}

pub struct FuelRule;

impl ExtractRule for FuelRule {
    fn name(&self) -> &'static str {
        "fuel"
    }

    fn extract(&self, message: &Message) -> Vec<Extraction> {
        first_lookup(message, FUELS, Field::Fuel)
    }
}

pub struct TransmissionRule;

impl ExtractRule for TransmissionRule {
    fn name(&self) -> &'static str {
        "transmission"
    }

    fn extract(&self, message: &Message) -> Vec<Extraction> {
        first_lookup(message, TRANSMISSIONS, Field::Transmission)
    }
}

/// Known city names, else a capitalised word after `in`/`at`.
pub struct LocationRule;

impl ExtractRule for LocationRule {
    fn name(&self) -> &'static str {
        "location"
    }

    fn extract(&self, message: &Message) -> Vec<Extraction> {
        let tokens = &message.tokens;
        if let Some((city, _)) = (0..tokens.len()).find_map(|i| phrase_at(tokens, i, CITIES)) {
            return vec![Extraction::text(Field::Location, city)];
        }
        tokens
            .windows(2)
            .find(|pair| {
                pair[0].is_any(&["in", "at", "location", "city"])
                    && pair[1].text.chars().next().is_some_and(char::is_uppercase)
                    && is_descriptor(&pair[1])
            })
            .map(|pair| vec![Extraction::text(Field::Location, pair[1].text.clone())])
            .unwrap_or_default()
    }
}

pub struct VehicleTypeRule;

impl ExtractRule for VehicleTypeRule {
    fn name(&self) -> &'static str {
        "vehicle_type"
    }

    fn extract(&self, message: &Message) -> Vec<Extraction> {
        let tokens = &message.tokens;
        let is_new = tokens.iter().any(|t| t.is("unregistered"))
            || tokens.windows(2).any(|pair| {
                (pair[0].is("brand") && pair[1].is("new"))
                    || (pair[0].is("new") && pair[1].is_any(&["car", "vehicle"]))
            });
        let is_used = tokens
            .iter()
            .any(|t| t.is_any(&["used", "pre-owned", "preowned", "second-hand", "secondhand"]));
        let found = if is_new {
            Some(VehicleType::New)
        } else if is_used {
            Some(VehicleType::Used)
        } else {
            None
        };
        found
            .map(|kind| {
                vec![Extraction {
                    field: Field::VehicleType,
                    value: FieldValue::Type(kind),
                }]
            })
            .unwrap_or_default()
    }
}

pub struct StatusRule;

impl ExtractRule for StatusRule {
    fn name(&self) -> &'static str {
        "status"
    }

    fn extract(&self, message: &Message) -> Vec<Extraction> {
        let status = if message.tokens.iter().any(|t| t.is("sold")) {
            Some(ListingStatus::Sold)
        } else if message.tokens.iter().any(|t| t.is("available")) {
            Some(ListingStatus::Available)
        } else {
            None
        };
        status
            .map(|s| {
                vec![Extraction {
                    field: Field::Status,
                    value: FieldValue::Status(s),
                }]
            })
            .unwrap_or_default()
    }
}
