//-
// Copyright (c) 2023, Jason Lingle
//
// This file is part of Inlet.
//
// Inlet is free software: you can  redistribute it and/or  modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Inlet is distributed  in the hope that  it will  be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Inlet. If not, see <http://www.gnu.org/licenses/>.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// for one connection.
///
/// Clones of a `LogPrefix` share the same underlying data.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    /// The protocol and peer, e.g. `smtp:192.0.2.1:25252`.
    connection: String,
    /// The name the client gave in HELO/EHLO/LHLO.
    helo: Option<String>,
    /// The authenticated identity, if any.
    user: Option<String>,
}

impl LogPrefix {
    pub fn new(connection: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                connection,
                helo: None,
                user: None,
            })),
        }
    }

    pub fn set_helo(&self, helo: String) {
        self.inner.lock().unwrap().helo = Some(helo);
    }

    pub fn set_user(&self, user: String) {
        self.inner.lock().unwrap().user = Some(user);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.connection)?;

        if inner.helo.is_some() || inner.user.is_some() {
            write!(f, "[{}", inner.user.as_deref().unwrap_or("<anon>"))?;
            if let Some(ref helo) = inner.helo {
                write!(f, " helo={}", helo)?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}
