/* rivi (c) by Nao Pross <np@0hm.ch>
 *
 *
 * rivi is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! Scripted transport recording everything written to it

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;

use super::Transport;

#[derive(Default)]
pub struct MockTransport {
    written: Vec<String>,
    responses: HashMap<String, VecDeque<String>>,
    failing: HashSet<String>,
}

impl MockTransport {
    pub fn new() -> MockTransport {
        MockTransport::default()
    }

    /// Queue `response` for the next time `query` is sent
    pub fn respond(&mut self, query: &str, response: &str) -> &mut MockTransport {
        self.responses
            .entry(query.to_string())
            .or_default()
            .push_back(response.to_string());
        self
    }

    /// Make every write of `command` fail after it is recorded
    pub fn fail_on(&mut self, command: &str) -> &mut MockTransport {
        self.failing.insert(command.to_string());
        self
    }

    pub fn written(&self) -> &[String] {
        &self.written
    }

    /// Written messages without the trailing newline
    pub fn commands(&self) -> Vec<&str> {
        self.written.iter().map(|w| w.trim_end_matches('\n')).collect()
    }
}

impl Transport for MockTransport {
    type Error = io::Error;

    fn write_message(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        let message = String::from_utf8(data.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let failed = self.failing.contains(message.trim_end_matches('\n'));
        self.written.push(message);
        if failed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write rejected"));
        }
        Ok(())
    }

    fn read_message(&mut self) -> Result<Vec<u8>, Self::Error> {
        let last = self
            .written
            .last()
            .map(|w| w.trim_end_matches('\n').to_string())
            .unwrap_or_default();

        self.responses
            .get_mut(&last)
            .and_then(VecDeque::pop_front)
            .map(String::into_bytes)
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, format!("no reply to {last:?}")))
    }
}
