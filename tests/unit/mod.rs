mod market_calendar;
mod progress_lifecycle;
