//! End-to-end scenarios exercised against the full local log engine
//! stack (metadata + chunk provider + FSM).

mod scenarios;
