use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::macros::format_description;
use time::Date;

/// An even-split emailing day is any date whose stable hash lands in
/// `0..=EVEN_SPLIT_THRESHOLD` modulo 100, so roughly a quarter of the
/// calendar qualifies (about 90 days per year).
pub const EVEN_SPLIT_THRESHOLD: u64 = 25;

/// Mid-year anchor for the even-split policy, as `(month, day)`.
/// July 2 is the 183rd day of a common year, so the two halves cover
/// 182 and 183 days respectively.
pub const MIDYEAR_ANCHOR: (u8, u8) = (7, 2);

const CAMPAIGN_WEEK_RANGES: [(u8, u8); 3] = [(1, 8), (18, 25), (35, 42)];
const CAMPAIGN_WEEKS: u64 = 8;
const BUCKETS_PER_CAMPAIGN: u64 = CAMPAIGN_WEEKS * 7;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ScheduleError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("selection queried for non-emailing day {0}")]
    NotAnEmailingDay(Date),
    #[error("calendar overflow while searching past {0}")]
    CalendarOverflow(Date),
}

/// One person in the user's network.
///
/// The salt is assigned once when the contact is created and never
/// regenerated afterwards; it is the sole input to the contact's
/// schedule slot, so renaming a contact keeps their slot.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Contact {
    pub name: String,
    pub salt: String,
}

impl Contact {
    /// Build a validated contact.
    ///
    /// # Errors
    /// Returns [`ScheduleError::Validation`] when the name or salt is
    /// blank.
    pub fn new(name: impl Into<String>, salt: impl Into<String>) -> Result<Self, ScheduleError> {
        let contact = Self { name: name.into(), salt: salt.into() };
        contact.validate()?;
        Ok(contact)
    }

    /// # Errors
    /// Returns [`ScheduleError::Validation`] when the name or salt is
    /// blank.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.name.trim().is_empty() {
            return Err(ScheduleError::Validation("contact name must be non-empty".to_string()));
        }
        if self.salt.trim().is_empty() {
            return Err(ScheduleError::Validation("contact salt must be non-empty".to_string()));
        }
        Ok(())
    }

    /// Process-independent identity hash, derived from the persisted
    /// salt alone. Ordinary `std::hash::Hash` is unusable here because
    /// it is randomized per process.
    #[must_use]
    pub fn stable_hash(&self) -> u64 {
        digest_to_u64(self.salt.as_bytes())
    }
}

fn digest_to_u64(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Canonical `YYYY-MM-DD` rendering used for hashing and display.
#[must_use]
pub fn canonical_day(date: Date) -> String {
    format!("{:04}-{:02}-{:02}", date.year(), u8::from(date.month()), date.day())
}

/// Process-independent hash of a calendar day.
#[must_use]
pub fn date_hash(date: Date) -> u64 {
    digest_to_u64(canonical_day(date).as_bytes())
}

/// Parse a `YYYY-MM-DD` string into a date.
///
/// # Errors
/// Returns [`ScheduleError::Validation`] for empty or malformed input;
/// nothing is silently coerced.
pub fn parse_day(value: &str) -> Result<Date, ScheduleError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ScheduleError::Validation("date must be non-empty".to_string()));
    }
    let format = format_description!("[year]-[month]-[day]");
    Date::parse(trimmed, &format)
        .map_err(|err| ScheduleError::Validation(format!("invalid date {trimmed:?}: {err}")))
}

/// All calendar days of `year` in ascending order, leap-year aware.
///
/// # Errors
/// Returns [`ScheduleError::Validation`] when the year is outside the
/// supported calendar range.
pub fn days_in_year(year: i32) -> Result<Vec<Date>, ScheduleError> {
    let count = time::util::days_in_year(year);
    (1..=count)
        .map(|ordinal| {
            Date::from_ordinal_date(year, ordinal).map_err(|err| {
                ScheduleError::Validation(format!("invalid day {ordinal} of year {year}: {err}"))
            })
        })
        .collect()
}

/// True when `date` falls strictly before the mid-year anchor of its
/// own year.
#[must_use]
pub fn before_midyear(date: Date) -> bool {
    (u8::from(date.month()), date.day()) < MIDYEAR_ANCHOR
}

/// Partition an ascending list of emailing days into the two year
/// halves. Both outputs stay in ascending order.
#[must_use]
pub fn split_at_midyear(days: &[Date]) -> (Vec<Date>, Vec<Date>) {
    let mut first_half = Vec::new();
    let mut second_half = Vec::new();
    for day in days {
        if before_midyear(*day) {
            first_half.push(*day);
        } else {
            second_half.push(*day);
        }
    }
    (first_half, second_half)
}

/// The two interchangeable scheduling strategies. Selection is a
/// closed set on purpose; see the policy docs for their guarantees.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePolicy {
    /// Deterministic ~25% of days are emailing days; every contact is
    /// surfaced exactly once in each half of the year.
    #[default]
    EvenSplit,
    /// Three fixed 8-week campaigns per year (ISO weeks 1-8, 18-25,
    /// 35-42); contacts map to day buckets inside a campaign.
    PeriodicBucket,
}

impl SchedulePolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EvenSplit => "even_split",
            Self::PeriodicBucket => "periodic_bucket",
        }
    }

    /// Pure membership predicate: is `date` an emailing day?
    #[must_use]
    pub fn should_email_day(self, date: Date) -> bool {
        match self {
            Self::EvenSplit => date_hash(date) % 100 <= EVEN_SPLIT_THRESHOLD,
            Self::PeriodicBucket => in_campaign_week(date.iso_week()),
        }
    }

    /// All emailing days of `year`, ascending.
    ///
    /// # Errors
    /// Returns [`ScheduleError::Validation`] when the year is outside
    /// the supported calendar range.
    pub fn emailing_days(self, year: i32) -> Result<Vec<Date>, ScheduleError> {
        Ok(days_in_year(year)?.into_iter().filter(|day| self.should_email_day(*day)).collect())
    }

    /// Whether `contact` is surfaced on emailing day `date`.
    ///
    /// The whole year's emailing-day set is recomputed on every query
    /// rather than persisted. That keeps the engine stateless and lets
    /// contacts added mid-year land in the correct slot for the rest
    /// of the year without any migration.
    ///
    /// # Errors
    /// Returns [`ScheduleError::NotAnEmailingDay`] when `date` is not
    /// an emailing day under this policy; callers must guard with
    /// [`Self::should_email_day`] rather than rely on a boolean.
    pub fn should_contact(self, contact: &Contact, date: Date) -> Result<bool, ScheduleError> {
        match self {
            Self::EvenSplit => even_split_should_contact(contact, date),
            Self::PeriodicBucket => periodic_should_contact(contact, date),
        }
    }

    /// First emailing day on or after `date`; short-circuits when
    /// `date` already qualifies. Both policies guarantee emailing days
    /// at bounded intervals, so the search terminates quickly.
    ///
    /// # Errors
    /// Returns [`ScheduleError::CalendarOverflow`] if the search runs
    /// off the end of the supported calendar (unreachable in practice).
    pub fn next_emailing_day(self, date: Date) -> Result<Date, ScheduleError> {
        let mut current = date;
        loop {
            if self.should_email_day(current) {
                return Ok(current);
            }
            current = current.next_day().ok_or(ScheduleError::CalendarOverflow(current))?;
        }
    }
}

fn in_campaign_week(week: u8) -> bool {
    CAMPAIGN_WEEK_RANGES.iter().any(|(start, end)| (*start..=*end).contains(&week))
}

fn as_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

fn even_split_should_contact(contact: &Contact, date: Date) -> Result<bool, ScheduleError> {
    let days = SchedulePolicy::EvenSplit.emailing_days(date.year())?;
    let (first_half, second_half) = split_at_midyear(&days);
    let half = if before_midyear(date) { first_half } else { second_half };
    // Membership in the half doubles as the emailing-day contract check.
    let Some(slot) = half.iter().position(|day| *day == date) else {
        return Err(ScheduleError::NotAnEmailingDay(date));
    };
    // Each contact maps to exactly one slot per half via the modulo,
    // so everyone is surfaced exactly twice a year.
    Ok(contact.stable_hash() % as_u64(half.len()) == as_u64(slot))
}

fn periodic_should_contact(contact: &Contact, date: Date) -> Result<bool, ScheduleError> {
    if !SchedulePolicy::PeriodicBucket.should_email_day(date) {
        return Err(ScheduleError::NotAnEmailingDay(date));
    }
    let weekday = u64::from(date.weekday().number_from_monday());
    let week = u64::from(date.iso_week());
    let bucket = weekday + week * CAMPAIGN_WEEKS;
    Ok(contact.stable_hash() % BUCKETS_PER_CAMPAIGN == bucket)
}

/// Recommendations for one calendar day, or `None` outside emailing
/// days.
///
/// Selected contacts keep the input order. An empty selection on an
/// emailing day is a valid outcome, not an error.
///
/// # Errors
/// Propagates policy errors; never fails for an empty contact list.
pub fn recommendations(
    contacts: &[Contact],
    policy: SchedulePolicy,
    date: Date,
) -> Result<Option<Vec<Contact>>, ScheduleError> {
    if !policy.should_email_day(date) {
        return Ok(None);
    }
    let mut selected = Vec::new();
    for contact in contacts {
        if policy.should_contact(contact, date)? {
            selected.push(contact.clone());
        }
    }
    Ok(Some(selected))
}

/// Plain-text body handed to the mail-transport collaborator.
#[must_use]
pub fn render_message(recommendations: Option<&[Contact]>, next_emailing_day: Date) -> String {
    match recommendations {
        None => format!("Next emailing day is {}.", canonical_day(next_emailing_day)),
        Some([]) => "Emailing day, but nobody is scheduled today. Add more contacts.".to_string(),
        Some(selected) => {
            selected.iter().map(|contact| contact.name.clone()).collect::<Vec<_>>().join("\n")
        }
    }
}

/// One entry of a whole-year schedule listing.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DayPlan {
    pub date: Date,
    pub recommendations: Option<Vec<Contact>>,
}

/// The full year's schedule, one entry per calendar day. Spoils the
/// surprise a bit, but indispensable for verifying fairness.
///
/// # Errors
/// Returns [`ScheduleError::Validation`] when the year is outside the
/// supported calendar range.
pub fn year_plan(
    contacts: &[Contact],
    policy: SchedulePolicy,
    year: i32,
) -> Result<Vec<DayPlan>, ScheduleError> {
    days_in_year(year)?
        .into_iter()
        .map(|date| {
            Ok(DayPlan { date, recommendations: recommendations(contacts, policy, date)? })
        })
        .collect()
}
