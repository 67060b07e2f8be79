//! Wire schema of `/predict`: the customer record, its validation and the response body.

use churn_core::{FeatureFrame, FeatureValue};
use serde::Serialize;
use serde_json::{Map, Value};

/// A request field that is missing, mistyped or out of range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl FieldError {
    fn new(field: &'static str, message: impl Into<String>) -> Self { Self { field, message: message.into() } }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}: {}", self.field, self.message) }
}

macro_rules! categorical {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name { $($variant),+ }

        impl $name {
            pub const VALUES: &'static [&'static str] = &[$($text),+];

            pub fn as_str(self) -> &'static str {
                match self { $(Self::$variant => $text),+ }
            }

            fn parse(raw: &str) -> Option<Self> {
                match raw { $($text => Some(Self::$variant),)+ _ => None }
            }
        }
    };
}

categorical!(Gender { Male => "Male", Female => "Female" });
categorical!(Region { North => "North", South => "South", East => "East", West => "West", Central => "Central" });
categorical!(ContractType { MonthToMonth => "Month-to-Month", OneYear => "One Year", TwoYear => "Two Year" });
categorical!(InternetService { Dsl => "DSL", FiberOptic => "Fiber optic", NoService => "No" });
categorical!(PhoneService { Yes => "Yes", No => "No" });
categorical!(MultipleLines { Yes => "Yes", No => "No", NoPhoneService => "No phone service" });
categorical!(PaymentMethod {
    ElectronicCheck => "Electronic check",
    MailedCheck => "Mailed check",
    BankTransfer => "Bank transfer (automatic)",
    CreditCard => "Credit card (automatic)",
});

pub const FIELDS: [&str; 12] = [
    "customer_id",
    "age",
    "gender",
    "region",
    "contract_type",
    "tenure_months",
    "monthly_charges",
    "total_charges",
    "internet_service",
    "phone_service",
    "multiple_lines",
    "payment_method",
];

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRequest {
    pub customer_id: String,
    pub age: u32,
    pub gender: Gender,
    pub region: Region,
    pub contract_type: ContractType,
    pub tenure_months: u32,
    pub monthly_charges: f64,
    pub total_charges: f64,
    pub internet_service: InternetService,
    pub phone_service: PhoneService,
    pub multiple_lines: MultipleLines,
    pub payment_method: PaymentMethod,
}

fn field<'a>(obj: &'a Map<String, Value>, name: &'static str) -> Result<&'a Value, FieldError> {
    match obj.get(name) {
        None | Some(Value::Null) => Err(FieldError::new(name, "field required")),
        Some(v) => Ok(v),
    }
}

fn text<'a>(obj: &'a Map<String, Value>, name: &'static str) -> Result<&'a str, FieldError> {
    field(obj, name)?.as_str().ok_or_else(|| FieldError::new(name, "expected a string"))
}

fn count(obj: &Map<String, Value>, name: &'static str) -> Result<u32, FieldError> {
    let v = field(obj, name)?;
    if v.as_i64().is_some_and(|n| n < 0) { return Err(FieldError::new(name, "must be non-negative")); }
    v.as_u64().and_then(|n| u32::try_from(n).ok()).ok_or_else(|| FieldError::new(name, "expected an integer"))
}

fn amount(obj: &Map<String, Value>, name: &'static str) -> Result<f64, FieldError> {
    let n = field(obj, name)?.as_f64().ok_or_else(|| FieldError::new(name, "expected a number"))?;
    if !n.is_finite() { return Err(FieldError::new(name, "must be finite")); }
    if n < 0.0 { return Err(FieldError::new(name, "must be non-negative")); }
    Ok(n)
}

fn choice<T>(obj: &Map<String, Value>, name: &'static str, parse: fn(&str) -> Option<T>, allowed: &[&str]) -> Result<T, FieldError> {
    let raw = text(obj, name)?;
    parse(raw).ok_or_else(|| FieldError::new(name, format!("'{raw}' is not one of: {}", allowed.join(", "))))
}

impl PredictionRequest {
    /// Parses and validates a JSON body. Fields are checked in declaration order and the first
    /// offending one is reported; unknown fields are rejected.
    pub fn from_json(body: &Value) -> Result<Self, FieldError> {
        let obj = body.as_object().ok_or_else(|| FieldError::new("body", "expected a JSON object"))?;
        if let Some(extra) = obj.keys().find(|k| !FIELDS.contains(&k.as_str())) {
            return Err(FieldError { field: "body", message: format!("unknown field '{extra}'") });
        }
        // echoed back verbatim; blank ids are still rejected
        let customer_id = text(obj, "customer_id")?;
        if customer_id.trim().is_empty() { return Err(FieldError::new("customer_id", "must not be empty")); }
        Ok(Self {
            customer_id: customer_id.to_string(),
            age: count(obj, "age")?,
            gender: choice(obj, "gender", Gender::parse, Gender::VALUES)?,
            region: choice(obj, "region", Region::parse, Region::VALUES)?,
            contract_type: choice(obj, "contract_type", ContractType::parse, ContractType::VALUES)?,
            tenure_months: count(obj, "tenure_months")?,
            monthly_charges: amount(obj, "monthly_charges")?,
            total_charges: amount(obj, "total_charges")?,
            internet_service: choice(obj, "internet_service", InternetService::parse, InternetService::VALUES)?,
            phone_service: choice(obj, "phone_service", PhoneService::parse, PhoneService::VALUES)?,
            multiple_lines: choice(obj, "multiple_lines", MultipleLines::parse, MultipleLines::VALUES)?,
            payment_method: choice(obj, "payment_method", PaymentMethod::parse, PaymentMethod::VALUES)?,
        })
    }

    /// Single-row frame with every field as a named column, `customer_id` included.
    pub fn to_frame(&self) -> FeatureFrame {
        FeatureFrame::single_row(vec![
            ("customer_id", FeatureValue::Text(self.customer_id.clone())),
            ("age", self.age.into()),
            ("gender", self.gender.as_str().into()),
            ("region", self.region.as_str().into()),
            ("contract_type", self.contract_type.as_str().into()),
            ("tenure_months", self.tenure_months.into()),
            ("monthly_charges", self.monthly_charges.into()),
            ("total_charges", self.total_charges.into()),
            ("internet_service", self.internet_service.as_str().into()),
            ("phone_service", self.phone_service.as_str().into()),
            ("multiple_lines", self.multiple_lines.as_str().into()),
            ("payment_method", self.payment_method.as_str().into()),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier { Low, High }

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub customer_id: String,
    pub churn_prediction: u8,
    pub churn_risk: RiskTier,
    pub interpretation: &'static str,
}

impl PredictionResult {
    /// `None` unless `output` is exactly 0 or 1.
    pub fn from_label(customer_id: String, output: f64) -> Option<Self> {
        let label: u8 = if output == 1.0 { 1 } else if output == 0.0 { 0 } else { return None };
        let (churn_risk, interpretation) = match label {
            1 => (RiskTier::High, "Customer at risk of churn"),
            _ => (RiskTier::Low, "Customer not at risk of churn"),
        };
        Some(Self { customer_id, churn_prediction: label, churn_risk, interpretation })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample() -> Value {
        json!({
            "customer_id": "CUST-1",
            "age": 30,
            "gender": "Female",
            "region": "West",
            "contract_type": "Month-to-Month",
            "tenure_months": 12,
            "monthly_charges": 50.5,
            "total_charges": 600.0,
            "internet_service": "DSL",
            "phone_service": "Yes",
            "multiple_lines": "No",
            "payment_method": "Electronic check"
        })
    }

    fn rejected(body: Value) -> FieldError { PredictionRequest::from_json(&body).unwrap_err() }

    #[test]
    fn parses_sample_record() {
        let req = PredictionRequest::from_json(&sample()).unwrap();
        assert_eq!(req.customer_id, "CUST-1");
        assert_eq!(req.contract_type, ContractType::MonthToMonth);
        assert_eq!(req.payment_method.as_str(), "Electronic check");
        let frame = req.to_frame();
        assert_eq!(frame.columns().len(), FIELDS.len());
        assert_eq!(frame.rows()[0][frame.column_index("age").unwrap()], FeatureValue::Number(30.0));
        assert_eq!(frame.rows()[0][frame.column_index("region").unwrap()], FeatureValue::Text("West".into()));
    }

    #[test]
    fn reports_the_offending_field() {
        let mut body = sample();
        body.as_object_mut().unwrap().remove("region");
        assert_eq!(rejected(body).field, "region");

        let mut body = sample();
        body["contract_type"] = json!("Weekly");
        let err = rejected(body);
        assert_eq!(err.field, "contract_type");
        assert!(err.message.contains("Month-to-Month"));

        let mut body = sample();
        body["age"] = json!(30.5);
        assert_eq!(rejected(body).field, "age");

        let mut body = sample();
        body["tenure_months"] = json!(-1);
        assert_eq!(rejected(body).message, "must be non-negative");

        let mut body = sample();
        body["monthly_charges"] = json!("50");
        assert_eq!(rejected(body).field, "monthly_charges");

        let mut body = sample();
        body["customer_id"] = json!("  ");
        assert_eq!(rejected(body).field, "customer_id");

        let mut body = sample();
        body["churn"] = json!(1);
        let err = rejected(body);
        assert_eq!(err.field, "body");
        assert!(err.message.contains("churn"));

        assert_eq!(rejected(json!([1, 2])).field, "body");
    }

    #[test]
    fn customer_id_is_kept_as_sent() {
        let mut body = sample();
        body["customer_id"] = json!(" CUST-1 ");
        let req = PredictionRequest::from_json(&body).unwrap();
        assert_eq!(req.customer_id, " CUST-1 ");
        assert_eq!(req.to_frame().rows()[0][0], FeatureValue::Text(" CUST-1 ".into()));
    }

    #[test]
    fn categorical_values_are_case_sensitive() {
        let mut body = sample();
        body["gender"] = json!("female");
        assert_eq!(rejected(body).field, "gender");
    }

    #[test]
    fn labels_map_to_risk_tiers() {
        let high = PredictionResult::from_label("C".into(), 1.0).unwrap();
        assert_eq!((high.churn_prediction, high.churn_risk), (1, RiskTier::High));
        let low = PredictionResult::from_label("C".into(), 0.0).unwrap();
        assert_eq!(serde_json::to_value(&low).unwrap()["churn_risk"], json!("LOW"));
        assert!(PredictionResult::from_label("C".into(), 0.7).is_none());
        assert!(PredictionResult::from_label("C".into(), f64::NAN).is_none());
    }
}
