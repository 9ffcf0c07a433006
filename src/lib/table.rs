use crate::arm::Arm;
use crate::columns::{record_line, ColumnMapping};
use crate::error::{AbError, Result};
use ahash::{HashSet, HashSetExt};
use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read as IoRead, Write as IoWrite};
use std::path::Path;

pub const TABLE_COLUMNS: [&str; 4] = ["user_id", "variant_name", "total_revenue", "converted"];

/// One user after aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub variant_name: Arm,
    pub total_revenue: f64,
    pub converted: u8,
}

impl UserRecord {
    pub fn new(user_id: impl Into<String>, variant_name: Arm, total_revenue: f64) -> Self {
        Self {
            user_id: user_id.into(),
            variant_name,
            total_revenue,
            converted: u8::from(total_revenue > 0.0),
        }
    }

    pub fn is_converted(&self) -> bool {
        self.converted == 1
    }

    fn check(&self) -> Result<()> {
        if !self.total_revenue.is_finite() || self.total_revenue < 0.0 {
            return Err(AbError::contract(format!(
                "user {}: total_revenue must be finite and non-negative, got {}",
                self.user_id, self.total_revenue
            )));
        }
        if self.converted > 1 {
            return Err(AbError::contract(format!(
                "user {}: converted must be 0 or 1, got {}",
                self.user_id, self.converted
            )));
        }
        if self.is_converted() != (self.total_revenue > 0.0) {
            return Err(AbError::contract(format!(
                "user {}: converted={} is inconsistent with total_revenue={}",
                self.user_id, self.converted, self.total_revenue
            )));
        }
        Ok(())
    }
}

/// Ordering of user ids: integers numerically first, then everything else lexicographically.
pub fn compare_user_ids(a: &str, b: &str) -> Ordering {
    fn key(id: &str) -> (bool, u64, &str) {
        match id.parse::<u64>() {
            Ok(n) => (false, n, id),
            Err(_) => (true, 0, id),
        }
    }
    key(a).cmp(&key(b))
}

/// Conversion and revenue observations of one arm, as seen by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmData {
    pub arm: Arm,
    pub n_users: u64,
    pub n_converted: u64,
    /// `total_revenue` of converted users only.
    pub revenue: Vec<f64>,
}

impl ArmData {
    pub fn conversion_rate(&self) -> Option<f64> {
        (self.n_users > 0).then(|| self.n_converted as f64 / self.n_users as f64)
    }

    pub fn mean_revenue(&self) -> Option<f64> {
        (!self.revenue.is_empty()).then(|| self.revenue.iter().sum::<f64>() / self.revenue.len() as f64)
    }
}

/// Per-user table, one row per user id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserTable {
    records: Vec<UserRecord>,
}

impl UserTable {
    pub fn new(records: Vec<UserRecord>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            record.check()?;
            if !seen.insert(record.user_id.as_str()) {
                return Err(AbError::contract(format!(
                    "user_id {} appears more than once",
                    record.user_id
                )));
            }
        }
        Ok(Self { records })
    }

    pub fn records(&self) -> &[UserRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn n_users(&self, arm: Arm) -> usize {
        self.records.iter().filter(|r| r.variant_name == arm).count()
    }

    pub fn arm_data(&self, arm: Arm) -> ArmData {
        let mut n_users = 0;
        let mut revenue = Vec::new();
        for record in self.records.iter().filter(|r| r.variant_name == arm) {
            n_users += 1;
            if record.is_converted() {
                revenue.push(record.total_revenue);
            }
        }
        ArmData {
            arm,
            n_users,
            n_converted: revenue.len() as u64,
            revenue,
        }
    }

    /// Both arms must have at least one user before a model can be fit.
    pub fn require_both_arms(&self) -> Result<()> {
        let empty: Vec<Arm> = Arm::iter().filter(|arm| self.n_users(*arm) == 0).collect();
        if !empty.is_empty() {
            return Err(AbError::contract(format!(
                "both arms need at least one user, no users in: {}",
                empty.iter().join(", ")
            )));
        }
        Ok(())
    }

    pub fn read<R: IoRead>(inner: R, origin: &Path) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(Trim::All)
            .from_reader(inner);
        let headers = reader
            .headers()
            .map_err(|e| AbError::input_read(origin, e))?
            .clone();
        let mapping = ColumnMapping::from_headers(&headers, &TABLE_COLUMNS)?;

        let mut records = Vec::new();
        let mut row = StringRecord::new();
        while reader
            .read_record(&mut row)
            .map_err(|e| AbError::input_read(origin, e))?
        {
            let line = record_line(&row);
            records.push(parse_user_record(&row, &mapping).map_err(|e| e.at_line(line))?);
        }
        debug!("Read {} user records from {}", records.len(), origin.display());
        Self::new(records)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| AbError::input_read(path, e))?;
        Self::read(file, path)
    }

    pub fn write<W: IoWrite>(&self, inner: W) -> csv::Result<()> {
        let mut writer = WriterBuilder::new().has_headers(true).from_writer(inner);
        for record in &self.records {
            writer.serialize(record)?;
        }
        if self.records.is_empty() {
            writer.write_record(TABLE_COLUMNS)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| AbError::output_write(path, e))?;
        self.write(file).map_err(|e| AbError::output_write(path, e))
    }
}

fn parse_user_record(row: &StringRecord, mapping: &ColumnMapping) -> Result<UserRecord> {
    let user_id = mapping.field(row, "user_id");
    if user_id.is_empty() {
        return Err(AbError::contract("empty user_id"));
    }
    let variant_name = mapping.field(row, "variant_name").parse::<Arm>()?;

    let revenue_cell = mapping.field(row, "total_revenue");
    let total_revenue: f64 = revenue_cell.parse().map_err(|_| {
        AbError::contract(format!("total_revenue '{}' is not a number", revenue_cell))
    })?;

    let converted_cell = mapping.field(row, "converted");
    let converted = match converted_cell.parse::<f64>() {
        Ok(v) if v == 0.0 => 0,
        Ok(v) if v == 1.0 => 1,
        _ => {
            return Err(AbError::contract(format!(
                "converted must be 0 or 1, got '{}'",
                converted_cell
            )));
        }
    };

    Ok(UserRecord {
        user_id: user_id.to_string(),
        variant_name,
        total_revenue,
        converted,
    })
}
