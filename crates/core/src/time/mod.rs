pub mod trading_month;
