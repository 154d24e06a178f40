use chrono::{Datelike, Months, NaiveDate, Weekday};

pub fn month_start(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
        .expect("the first of an existing month is a valid date")
}

pub fn next_month_start(date: NaiveDate) -> NaiveDate {
    month_start(date) + Months::new(1)
}

pub fn is_month_start(date: NaiveDate) -> bool {
    date.day() == 1
}

pub fn last_day_of_month(date: NaiveDate) -> NaiveDate {
    next_month_start(date)
        .pred_opt()
        .expect("the month before an existing month has a last day")
}

// Daily price feeds only carry trading days, so a month's first row is often
// not the 1st and its last row often not the calendar-last day. These two
// checks accept the usual exchange-calendar boundaries without consulting a
// holiday table.

// First calendar day, or the first Monday.
pub fn starts_trading_month(date: NaiveDate) -> bool {
    if date.day() == 1 {
        return true;
    }
    date.weekday() == Weekday::Mon && date.day() <= 7
}

// Last calendar day, or a Friday within the month's last three days.
pub fn ends_trading_month(date: NaiveDate) -> bool {
    let last = last_day_of_month(date);
    if date == last {
        return true;
    }
    date.weekday() == Weekday::Fri && date.day() + 3 > last.day()
}
