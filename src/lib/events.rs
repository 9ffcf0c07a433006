use crate::arm::Arm;
use crate::columns::{record_line, ColumnMapping};
use crate::error::{AbError, Result};
use csv::{ReaderBuilder, StringRecord, Trim};
use log::debug;
use std::fs::File;
use std::io::Read as IoRead;
use std::path::Path;

pub const RAW_COLUMNS: [&str; 3] = ["user_id", "variant_name", "revenue"];

/// One row of the raw experiment export.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub user_id: String,
    pub arm: Arm,
    pub revenue: f64,
}

impl RawEvent {
    pub fn new(user_id: impl Into<String>, arm: Arm, revenue: f64) -> Self {
        Self {
            user_id: user_id.into(),
            arm,
            revenue,
        }
    }
}

/// Revenue of a raw cell. Missing values count as zero revenue.
fn parse_revenue(cell: &str, line: u64) -> Result<f64> {
    if cell.is_empty() {
        return Ok(0.0);
    }
    match cell.to_ascii_lowercase().as_str() {
        "na" | "nan" | "null" | "none" => return Ok(0.0),
        _ => {}
    }
    let revenue: f64 = cell
        .parse()
        .map_err(|_| AbError::contract(format!("line {}: revenue '{}' is not a number", line, cell)))?;
    if !revenue.is_finite() || revenue < 0.0 {
        return Err(AbError::contract(format!(
            "line {}: revenue must be a finite non-negative number, got {}",
            line, revenue
        )));
    }
    Ok(revenue)
}

fn parse_event(record: &StringRecord, mapping: &ColumnMapping) -> Result<RawEvent> {
    let line = record_line(record);
    let user_id = mapping.field(record, "user_id");
    if user_id.is_empty() {
        return Err(AbError::contract(format!("line {}: empty user_id", line)));
    }
    let arm = mapping
        .field(record, "variant_name")
        .parse::<Arm>()
        .map_err(|e| e.at_line(line))?;
    let revenue = parse_revenue(mapping.field(record, "revenue"), line)?;
    Ok(RawEvent::new(user_id, arm, revenue))
}

/// Parse raw events from any reader. `origin` only labels I/O errors.
pub fn read_raw_events<R: IoRead>(inner: R, origin: &Path) -> Result<Vec<RawEvent>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .from_reader(inner);
    let headers = reader
        .headers()
        .map_err(|e| AbError::input_read(origin, e))?
        .clone();
    let mapping = ColumnMapping::from_headers(&headers, &RAW_COLUMNS)?;

    let mut events = Vec::new();
    let mut record = StringRecord::new();
    loop {
        let has_record = reader
            .read_record(&mut record)
            .map_err(|e| AbError::input_read(origin, e))?;
        if !has_record {
            break;
        }
        events.push(parse_event(&record, &mapping)?);
    }
    debug!("Parsed {} raw events from {}", events.len(), origin.display());
    Ok(events)
}

pub fn load_raw_events(path: &Path) -> Result<Vec<RawEvent>> {
    let file = File::open(path).map_err(|e| AbError::input_read(path, e))?;
    read_raw_events(file, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn origin() -> &'static Path {
        Path::new("<memory>")
    }

    #[test]
    fn test_reads_uppercase_headers() {
        let data = "USER_ID,VARIANT_NAME,REVENUE\n737,variant,0\n2423,control,1.5\n";
        let events = read_raw_events(data.as_bytes(), origin()).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], RawEvent::new("737", Arm::Variant, 0.0));
        assert_eq!(events[1], RawEvent::new("2423", Arm::Control, 1.5));
    }

    #[test]
    fn test_missing_revenue_is_zero() {
        let data = "user_id,variant_name,revenue\n1,control,\n2,control,NA\n3,variant,nan\n";
        let events = read_raw_events(data.as_bytes(), origin()).unwrap();
        assert!(events.iter().all(|e| e.revenue == 0.0));
    }

    #[test]
    fn test_negative_revenue_rejected() {
        let data = "user_id,variant_name,revenue\n1,control,-2.0\n";
        let err = read_raw_events(data.as_bytes(), origin()).unwrap_err();
        assert!(matches!(err, AbError::DataContractViolation(_)));
    }

    #[test]
    fn test_unknown_arm_rejected() {
        let data = "user_id,variant_name,revenue\n1,treatment,2.0\n";
        let err = read_raw_events(data.as_bytes(), origin()).unwrap_err();
        match err {
            AbError::DataContractViolation(msg) => assert!(msg.contains("line 2"), "{}", msg),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_missing_column_rejected() {
        let data = "user_id,revenue\n1,2.0\n";
        let err = read_raw_events(data.as_bytes(), origin()).unwrap_err();
        assert!(matches!(err, AbError::DataContractViolation(_)));
    }

    #[test]
    fn test_missing_file_is_input_error() {
        let err = load_raw_events(Path::new("/nonexistent/dir/raw.csv")).unwrap_err();
        assert!(matches!(err, AbError::InputRead { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(b"user_id,variant_name,revenue,extra\n5,control,3.25,x\n")
            .expect("Failed to write data");
        let events = load_raw_events(file.path()).unwrap();
        assert_eq!(events, vec![RawEvent::new("5", Arm::Control, 3.25)]);
    }
}
