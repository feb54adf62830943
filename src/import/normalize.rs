use crate::import::feed::FeedRecord;
use rust_decimal::Decimal;

#[derive(Clone, Debug)]
pub struct NormalizedRow {
    pub row_number: usize,
    pub item_id: i64,
    pub product_id: i64,
    pub product_name: String,
    pub product_description: Option<String>,
    pub manufacturer_id: i64,
    pub manufacturer_name: String,
    pub category_path_id: Option<i64>,
    pub category_path_name: Option<String>,
    pub item_description: Option<String>,
    pub image_url: Option<String>,
    pub ndc_item_code: Option<String>,
    pub package: Option<String>,
    pub unit_price: Option<Decimal>,
    pub price_description: Option<String>,
    pub availability: Option<String>,
    pub packing_list_description: Option<String>,
    pub unit_weight: Option<Decimal>,
    pub unit_volume: Option<Decimal>,
    pub uom_factor: Option<Decimal>,
    pub country_of_origin: Option<String>,
    pub tariff_code: Option<String>,
    pub hazmat_code: Option<String>,
    pub hazmat_class: Option<String>,
    pub pharmacy_product_type: Option<String>,
    pub national_drug_code: Option<String>,
    pub brand_id: Option<i64>,
    pub brand_name: Option<String>,
}

impl NormalizedRow {
    /// The row is still written, but the orchestrator records an
    /// advisory error for it.
    pub fn missing_category_path(&self) -> bool {
        self.category_path_id.is_none()
    }
}

#[derive(Clone, Debug)]
pub struct RowValidationError {
    pub row_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for RowValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Row {}: {}: {}", self.row_number, self.field, self.message)
    }
}

impl std::error::Error for RowValidationError {}

fn invalid(row_number: usize, field: &str, message: impl Into<String>) -> RowValidationError {
    RowValidationError {
        row_number,
        field: field.to_string(),
        message: message.into(),
    }
}

fn opt_text(record: &FeedRecord, header: &str) -> Option<String> {
    record
        .get(header)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

fn required_text(
    row_number: usize,
    record: &FeedRecord,
    header: &str,
) -> Result<String, RowValidationError> {
    opt_text(record, header).ok_or_else(|| invalid(row_number, header, format!("{header} is required")))
}

fn required_int(
    row_number: usize,
    record: &FeedRecord,
    header: &str,
) -> Result<i64, RowValidationError> {
    let raw = required_text(row_number, record, header)?;
    raw.parse::<i64>()
        .map_err(|_| invalid(row_number, header, format!("{header} must be an integer, got \"{raw}\"")))
}

fn opt_int(
    row_number: usize,
    record: &FeedRecord,
    header: &str,
) -> Result<Option<i64>, RowValidationError> {
    opt_text(record, header)
        .map(|raw| {
            raw.parse::<i64>().map_err(|_| {
                invalid(row_number, header, format!("{header} must be an integer, got \"{raw}\""))
            })
        })
        .transpose()
}

fn opt_decimal(
    row_number: usize,
    record: &FeedRecord,
    header: &str,
) -> Result<Option<Decimal>, RowValidationError> {
    opt_text(record, header)
        .map(|raw| {
            raw.parse::<Decimal>().map_err(|_| {
                invalid(
                    row_number,
                    header,
                    format!("{header} must be a decimal number, got \"{raw}\""),
                )
            })
        })
        .transpose()
}

pub fn normalize(
    row_number: usize,
    record: &FeedRecord,
) -> Result<NormalizedRow, RowValidationError> {
    let item_id = required_int(row_number, record, "ItemID")?;
    let product_id = required_int(row_number, record, "ProductID")?;
    let manufacturer_id = required_int(row_number, record, "ManufacturerID")?;
    let manufacturer_name = required_text(row_number, record, "ManufacturerName")?;
    let product_name = required_text(row_number, record, "ProductName")?;

    let category_path_id = opt_int(row_number, record, "CategoryPathID")?;
    let category_path_name = opt_text(record, "CategoryPathName");
    if category_path_id.is_some() && category_path_name.is_none() {
        return Err(invalid(
            row_number,
            "CategoryPathName",
            "CategoryPathName is required when CategoryPathID is present",
        ));
    }

    Ok(NormalizedRow {
        row_number,
        item_id,
        product_id,
        product_name,
        product_description: opt_text(record, "ProductDescription"),
        manufacturer_id,
        manufacturer_name,
        category_path_id,
        category_path_name: category_path_id.and(category_path_name),
        item_description: opt_text(record, "ItemDescription"),
        image_url: opt_text(record, "ItemImageURL"),
        ndc_item_code: opt_text(record, "NDCItemCode"),
        package: opt_text(record, "Package"),
        unit_price: opt_decimal(row_number, record, "UnitPrice")?,
        price_description: opt_text(record, "PriceDescription"),
        availability: opt_text(record, "Availability"),
        packing_list_description: opt_text(record, "PackingListDescription"),
        unit_weight: opt_decimal(row_number, record, "UnitWeight")?,
        unit_volume: opt_decimal(row_number, record, "UnitVolume")?,
        uom_factor: opt_decimal(row_number, record, "UOMFactor")?,
        country_of_origin: opt_text(record, "CountryOfOrigin"),
        tariff_code: opt_text(record, "TariffCode"),
        hazmat_code: opt_text(record, "HazmatCode"),
        hazmat_class: opt_text(record, "HazmatClass"),
        pharmacy_product_type: opt_text(record, "PharmacyProductType"),
        national_drug_code: opt_text(record, "NationalDrugCode"),
        brand_id: opt_int(row_number, record, "BrandID")?,
        brand_name: opt_text(record, "BrandName"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(pairs: &[(&str, &str)]) -> FeedRecord {
        FeedRecord::from_pairs(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
    }

    fn valid_record() -> FeedRecord {
        record(&[
            ("ItemID", "1001"),
            ("ProductID", "9001"),
            ("ManufacturerID", "55"),
            ("ManufacturerName", "Acme Medical"),
            ("ProductName", "Nitrile Exam Gloves"),
            ("CategoryPathID", "7"),
            ("CategoryPathName", "Gloves>Exam"),
            ("UnitPrice", "12.99"),
            ("UnitWeight", "  0.45 "),
            ("BrandID", "77"),
        ])
    }

    #[test]
    fn normalizes_a_valid_row() {
        let row = normalize(2, &valid_record()).expect("valid row");
        assert_eq!(row.item_id, 1001);
        assert_eq!(row.manufacturer_name, "Acme Medical");
        assert_eq!(row.unit_price, Some(dec!(12.99)));
        assert_eq!(row.unit_weight, Some(dec!(0.45)));
        assert_eq!(row.category_path_name.as_deref(), Some("Gloves>Exam"));
        assert!(!row.missing_category_path());
    }

    #[test]
    fn rejects_a_non_numeric_required_id() {
        let mut pairs = vec![
            ("ItemID", "1001"),
            ("ProductID", "9001"),
            ("ManufacturerID", "not-a-number"),
            ("ManufacturerName", "Acme Medical"),
            ("ProductName", "Nitrile Exam Gloves"),
        ];
        let err = normalize(3, &record(&pairs)).expect_err("must fail");
        assert_eq!(err.field, "ManufacturerID");
        assert_eq!(err.row_number, 3);

        pairs[0] = ("ItemID", "abc");
        let err = normalize(3, &record(&pairs)).expect_err("must fail");
        assert_eq!(err.field, "ItemID");
    }

    #[test]
    fn rejects_blank_required_text() {
        let rec = record(&[
            ("ItemID", "1001"),
            ("ProductID", "9001"),
            ("ManufacturerID", "55"),
            ("ManufacturerName", "   "),
            ("ProductName", "Nitrile Exam Gloves"),
        ]);
        let err = normalize(2, &rec).expect_err("must fail");
        assert_eq!(err.field, "ManufacturerName");
    }

    #[test]
    fn requires_a_name_when_a_category_path_id_is_present() {
        let rec = record(&[
            ("ItemID", "1001"),
            ("ProductID", "9001"),
            ("ManufacturerID", "55"),
            ("ManufacturerName", "Acme Medical"),
            ("ProductName", "Nitrile Exam Gloves"),
            ("CategoryPathID", "7"),
        ]);
        let err = normalize(2, &rec).expect_err("must fail");
        assert_eq!(err.field, "CategoryPathName");
    }

    #[test]
    fn accepts_a_row_without_a_category_path() {
        let rec = record(&[
            ("ItemID", "1001"),
            ("ProductID", "9001"),
            ("ManufacturerID", "55"),
            ("ManufacturerName", "Acme Medical"),
            ("ProductName", "Nitrile Exam Gloves"),
        ]);
        let row = normalize(2, &rec).expect("valid row");
        assert!(row.missing_category_path());
        assert_eq!(row.category_path_name, None);
    }

    #[test]
    fn rejects_an_unparseable_unit_price() {
        let rec = record(&[
            ("ItemID", "1001"),
            ("ProductID", "9001"),
            ("ManufacturerID", "55"),
            ("ManufacturerName", "Acme Medical"),
            ("ProductName", "Nitrile Exam Gloves"),
            ("UnitPrice", "12,99"),
        ]);
        let err = normalize(2, &rec).expect_err("must fail");
        assert_eq!(err.field, "UnitPrice");
    }

    #[test]
    fn blank_optional_cells_normalize_to_absent() {
        let rec = record(&[
            ("ItemID", "1001"),
            ("ProductID", "9001"),
            ("ManufacturerID", "55"),
            ("ManufacturerName", "Acme Medical"),
            ("ProductName", "Nitrile Exam Gloves"),
            ("ItemDescription", "   "),
            ("CountryOfOrigin", ""),
        ]);
        let row = normalize(2, &rec).expect("valid row");
        assert_eq!(row.item_description, None);
        assert_eq!(row.country_of_origin, None);
    }
}
