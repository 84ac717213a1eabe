//! Server-side Lua for the atomic operations.
//!
//! Each script is the whole operation; a caller never splits one into a read
//! followed by a write.

/// KEYS[1] counter, ARGV[1] limit, ARGV[2] ttl seconds.
///
/// The TTL is only touched on success. A rejected acquire must not extend a
/// stale counter, or the counter never expires.
pub(super) const ACQUIRE_SLOT: &str = r#"
local limit = tonumber(ARGV[1])
if limit <= 0 then
  return 1
end
local current = redis.call('INCR', KEYS[1])
if current > limit then
  local restored = redis.call('DECR', KEYS[1])
  if restored <= 0 then
    redis.call('DEL', KEYS[1])
  end
  return 0
end
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
return current
"#;

/// KEYS[1] counter, ARGV[1] ttl seconds.
pub(super) const RELEASE_SLOT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
local remaining = redis.call('DECR', KEYS[1])
if remaining <= 0 then
  redis.call('DEL', KEYS[1])
  return 0
end
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
return remaining
"#;

/// KEYS[1] lock, ARGV[1] owner, ARGV[2] ttl seconds.
pub(super) const REFRESH_LEADER_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
end
return 0
"#;

/// KEYS[1] lock, ARGV[1] owner.
pub(super) const RELEASE_LEADER_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// KEYS[1] counter, ARGV[1] observed, ARGV[2] new value, ARGV[3] ttl seconds.
pub(super) const RECONCILE_COUNTER: &str = r#"
local ttl = tonumber(ARGV[3])
if ttl == nil or ttl <= 0 then
  return 'invalid_ttl'
end
local raw = redis.call('GET', KEYS[1])
if not raw then
  return 'deleted'
end
local current = tonumber(raw)
if current == nil then
  return 'invalid'
end
if current ~= tonumber(ARGV[1]) then
  return 'mismatch:' .. raw
end
local desired = tonumber(ARGV[2])
if desired <= 0 then
  redis.call('DEL', KEYS[1])
  return 'ok:del'
end
redis.call('SET', KEYS[1], desired, 'EX', ttl)
return 'ok:set'
"#;
