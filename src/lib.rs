pub mod commands;
pub mod connection;
pub mod control;
pub mod energy;
pub mod faults;
pub mod modbus;
pub mod monitor;
pub mod output;
pub mod registers;
pub mod schedule;
pub mod session;
pub mod sweep;
pub mod telemetry;
pub mod transport;
