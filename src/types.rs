//! Bet record and its validation rules.

use std::fmt;

use chrono::NaiveDate;

use crate::error::RejectReason;
use crate::frame::FIELD_SEPARATOR;

pub const MAX_NAME_LENGTH: usize = 32;
pub const MAX_LAST_NAME_LENGTH: usize = MAX_NAME_LENGTH / 2;
pub const ID_NUMBER_LENGTH: usize = 8;
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Separator of the fields of one line in the agency CSV file.
pub const INPUT_SEPARATOR: char = ',';

/// One validated bet, ready to be put on the wire.
///
/// Only constructed through [`Bet::new`] or [`Bet::parse_line`], so every
/// value reaching a batch already passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bet {
    agency: String,
    first_name: String,
    last_name: String,
    id_number: String,
    date_of_birth: NaiveDate,
    number: String,
}

impl Bet {
    pub fn new(
        agency: &str,
        first_name: &str,
        last_name: &str,
        id_number: &str,
        date_of_birth: &str,
        number: &str,
    ) -> Result<Self, RejectReason> {
        if !names_are_valid(first_name, last_name) {
            return Err(RejectReason::Name);
        }
        let date_of_birth = NaiveDate::parse_from_str(date_of_birth, DATE_FORMAT)
            .map_err(|_| RejectReason::DateOfBirth)?;
        if id_number.len() != ID_NUMBER_LENGTH || !is_numeric(id_number) {
            return Err(RejectReason::IdNumber);
        }
        if !is_numeric(number) {
            return Err(RejectReason::Number);
        }

        Ok(Self {
            agency: agency.to_owned(),
            first_name: first_name.to_owned(),
            last_name: last_name.to_owned(),
            id_number: id_number.to_owned(),
            date_of_birth,
            number: number.to_owned(),
        })
    }

    /// Parses one `first,last,id,dob,number` line of an agency file.
    ///
    /// Extra trailing fields are ignored.
    pub fn parse_line(agency: &str, line: &str) -> Result<Self, RejectReason> {
        let fields: Vec<&str> = line.trim_end_matches('\r').split(INPUT_SEPARATOR).collect();
        if fields.len() < 5 {
            return Err(RejectReason::FieldCount(fields.len()));
        }
        Self::new(agency, fields[0], fields[1], fields[2], fields[3], fields[4])
    }

    pub fn agency(&self) -> &str {
        &self.agency
    }

    pub fn first_name(&self) -> &str {
        &self.first_name
    }

    pub fn last_name(&self) -> &str {
        &self.last_name
    }

    pub fn id_number(&self) -> &str {
        &self.id_number
    }

    pub fn date_of_birth(&self) -> NaiveDate {
        self.date_of_birth
    }

    pub fn number(&self) -> &str {
        &self.number
    }
}

/// Wire form: `agency;first;last;id;dob;number`.
impl fmt::Display for Bet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = FIELD_SEPARATOR;
        write!(
            f,
            "{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}",
            self.agency,
            self.first_name,
            self.last_name,
            self.id_number,
            self.date_of_birth.format(DATE_FORMAT),
            self.number,
        )
    }
}

fn names_are_valid(first_name: &str, last_name: &str) -> bool {
    !first_name.is_empty()
        && !last_name.is_empty()
        && first_name.len() <= MAX_NAME_LENGTH
        && last_name.len() <= MAX_LAST_NAME_LENGTH
        && !first_name.contains(FIELD_SEPARATOR)
        && !last_name.contains(FIELD_SEPARATOR)
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
