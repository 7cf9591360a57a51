pub mod actuators;
pub mod alarm;
pub mod alerts;
pub mod config;
pub mod control;
pub mod decision;
pub mod doors;
pub mod forecast;
pub mod modes;
pub mod planner;
pub mod readings;
pub mod records;
pub mod web;
