// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A multi-threaded HTTP/1.1 serving core: readiness reactor, worker pool,
//! timer heap and bounded database pool over [`mio`], serving login and
//! registration against a relational database plus arbitrary static files
//! from a resource directory.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod context;
pub mod db;
pub mod error;
pub mod logging;
pub mod pool;
pub mod reactor;
pub mod request;
pub mod response;
pub mod server;
pub mod timer;
