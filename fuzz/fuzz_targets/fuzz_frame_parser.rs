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

#![no_main]

use libfuzzer_sys::fuzz_target;
use spdy_engine::{
    parser::Frame,
    session::{Session, SessionConfig},
};

fuzz_target!(|data: &[u8]| {
    if let Ok((frame, used)) = Frame::parse(data) {
        assert!(used <= data.len());
        let _ = frame.stream_id();
    }

    if let Ok(mut session) = Session::new(SessionConfig::default()) {
        let _ = session.on_bytes_available(data);
    }
});
