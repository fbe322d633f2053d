use chrono::NaiveDateTime;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementRecord {
    pub timestamp: NaiveDateTime,
    /// Raw PT928 reading, 0 means no reading.
    pub pressure: u32,
    /// Degrees Celsius.
    pub temperature: f32,
    /// Supply voltage in volts.
    pub voltage: f32,
}

impl MeasurementRecord {
    /// Only complete samples are worth persisting.
    pub fn is_valid(&self) -> bool {
        self.pressure != 0 && !self.temperature.is_nan()
    }

    /// One log row, `'dd-mm-yyyy hh:mm:ss:mmm','p','t','v'` plus newline.
    pub fn to_row(&self) -> String {
        format!(
            "'{}','{}','{:.2}','{:.2}'\n",
            self.timestamp.format("%d-%m-%Y %H:%M:%S:%3f"),
            self.pressure,
            self.temperature,
            self.voltage
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::NaiveDate;

    fn at(ms: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 7)
            .unwrap()
            .and_hms_milli_opt(9, 4, 5, ms)
            .unwrap()
    }

    #[test]
    fn row_format() {
        let record = MeasurementRecord {
            timestamp: at(26),
            pressure: 1193046,
            temperature: 21.456,
            voltage: 12.1,
        };
        assert_eq!(record.to_row(), "'07-03-2025 09:04:05:026','1193046','21.46','12.10'\n");
    }

    #[test]
    fn validity() {
        let mut record = MeasurementRecord {
            timestamp: at(0),
            pressure: 5,
            temperature: 20.0,
            voltage: f32::NAN,
        };
        assert!(record.is_valid());

        record.temperature = f32::NAN;
        assert!(!record.is_valid());

        record.temperature = 20.0;
        record.pressure = 0;
        assert!(!record.is_valid());
    }
}
