//! Date tables
//!
//! Conversion between host date/time values and `os.date("*t")`-style
//! tables (`year`, `month`, `day`, `hour`, `min`, `sec`, `wday`, `yday`,
//! `isdst`). `wday` counts from Sunday = 1.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::error::{Error, Result};
use crate::interpreter::Interpreter;
use crate::table::TableRef;
use crate::value::HostValue;

/// Broken-down date as scripts see it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptDate {
    /// Full year
    pub year: i32,
    /// 1..=12
    pub month: u32,
    /// 1..=31
    pub day: u32,
    /// 0..=23
    pub hour: u32,
    /// 0..=59
    pub min: u32,
    /// 0..=59
    pub sec: u32,
    /// Day of the week, Sunday = 1
    pub wday: u32,
    /// Day of the year, January 1st = 1
    pub yday: u32,
    /// Daylight saving flag (always false for naive dates)
    pub isdst: bool,
}

impl ScriptDate {
    /// Break down a date/time
    pub fn from_datetime(dt: &NaiveDateTime) -> Self {
        Self {
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
            min: dt.minute(),
            sec: dt.second(),
            wday: dt.weekday().number_from_sunday(),
            yday: dt.ordinal(),
            isdst: false,
        }
    }

    /// Reassemble the date/time
    ///
    /// `wday` and `yday` are ignored.
    pub fn to_datetime(&self) -> Result<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
            .and_then(|d| d.and_hms_opt(self.hour, self.min, self.sec))
            .ok_or_else(|| {
                Error::runtime(format!(
                    "invalid date {}-{:02}-{:02} {:02}:{:02}:{:02}",
                    self.year, self.month, self.day, self.hour, self.min, self.sec
                ))
            })
    }

    /// Read a date table
    ///
    /// `year`, `month` and `day` are required; `hour` defaults to 12, `min`
    /// and `sec` to 0.
    pub fn from_table(table: &TableRef) -> Result<Self> {
        let field = |name: &str, default: Option<i64>| -> Result<i64> {
            match table.get(name)? {
                HostValue::Nil => default
                    .ok_or_else(|| Error::runtime(format!("field '{}' missing in date table", name))),
                v => v
                    .as_i64()
                    .or_else(|| v.as_f64().and_then(moonbridge_vm::value::float_to_integer))
                    .ok_or_else(|| Error::coercion("integer", v.type_name())),
            }
        };
        let date = Self {
            year: narrow("year", field("year", None)?)?,
            month: narrow("month", field("month", None)?)?,
            day: narrow("day", field("day", None)?)?,
            hour: narrow("hour", field("hour", Some(12))?)?,
            min: narrow("min", field("min", Some(0))?)?,
            sec: narrow("sec", field("sec", Some(0))?)?,
            wday: 0,
            yday: 0,
            isdst: matches!(table.get("isdst")?, HostValue::Bool(true)),
        };
        // fill in the derived fields
        let dt = date.to_datetime()?;
        Ok(Self {
            isdst: date.isdst,
            ..Self::from_datetime(&dt)
        })
    }

    /// Write the fields into `table`
    pub fn write_to(&self, table: &TableRef) -> Result<()> {
        table.set("year", self.year as i64)?;
        table.set("month", self.month as i64)?;
        table.set("day", self.day as i64)?;
        table.set("hour", self.hour as i64)?;
        table.set("min", self.min as i64)?;
        table.set("sec", self.sec as i64)?;
        table.set("wday", self.wday as i64)?;
        table.set("yday", self.yday as i64)?;
        table.set("isdst", self.isdst)?;
        Ok(())
    }

    /// Build a fresh date table in `interp`
    pub fn to_table(&self, interp: &Interpreter) -> Result<TableRef> {
        let table = interp.new_table()?;
        self.write_to(&table)?;
        Ok(table)
    }
}

/// Convert a date field to its storage type, rejecting out-of-range values
fn narrow<T: TryFrom<i64>>(name: &str, value: i64) -> Result<T> {
    T::try_from(value).map_err(|_| Error::coercion(format!("date field '{}'", name), value))
}

impl From<NaiveDateTime> for ScriptDate {
    fn from(dt: NaiveDateTime) -> Self {
        Self::from_datetime(&dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(8, 30, 15)
            .unwrap()
    }

    #[test]
    fn test_breakdown() {
        let d = ScriptDate::from_datetime(&sample());
        assert_eq!((d.year, d.month, d.day), (2024, 3, 10));
        assert_eq!((d.hour, d.min, d.sec), (8, 30, 15));
        // 2024-03-10 was a Sunday
        assert_eq!(d.wday, 1);
        assert_eq!(d.yday, 31 + 29 + 10);
        assert_eq!(d.to_datetime().unwrap(), sample());
    }

    #[test]
    fn test_table_roundtrip_and_defaults() {
        let interp = Interpreter::new().unwrap();
        let table = ScriptDate::from(sample()).to_table(&interp).unwrap();
        assert_eq!(table.get("wday").unwrap(), HostValue::Int(1));
        assert_eq!(ScriptDate::from_table(&table).unwrap().to_datetime().unwrap(), sample());

        let partial = interp.new_table().unwrap();
        partial.set("year", 2000).unwrap();
        partial.set("month", 1).unwrap();
        partial.set("day", 1).unwrap();
        let d = ScriptDate::from_table(&partial).unwrap();
        assert_eq!((d.hour, d.min, d.sec), (12, 0, 0));
        assert_eq!(d.wday, 7);
    }

    #[test]
    fn test_missing_field_is_an_error() {
        let interp = Interpreter::new().unwrap();
        let table = interp.new_table().unwrap();
        table.set("year", 2000).unwrap();
        assert!(ScriptDate::from_table(&table).is_err());
    }

    #[test]
    fn test_oversized_field_is_rejected() {
        let interp = Interpreter::new().unwrap();
        let table = interp.new_table().unwrap();
        table.set("year", 2000).unwrap();
        table.set("month", 4_294_967_297i64).unwrap();
        table.set("day", 1).unwrap();
        let err = ScriptDate::from_table(&table).unwrap_err();
        assert!(matches!(err, Error::Coercion { ref got, .. } if got == "4294967297"));

        table.set("month", 1).unwrap();
        table.set("sec", -1).unwrap();
        assert!(matches!(ScriptDate::from_table(&table), Err(Error::Coercion { .. })));
    }
}
