// jumpgate: the bastion session gateway
//
// Wires the websocket surface to the session core: connect upgrades a
// client into a brokered session, monitor attaches admin observers, close
// terminates sessions on an admin's behalf.

pub mod config;
pub mod i18n;
pub mod routes;
pub mod state;
pub mod ws;
