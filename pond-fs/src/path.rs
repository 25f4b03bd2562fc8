//! # 路径解析层
//!
//! 路径字符串在这里化为`(父目录句柄, 最终名)`，
//! 目录层据此完成真正的查找、创建或删除。

use alloc::string::String;
use alloc::sync::Arc;

use crate::dir::Directory;
use crate::Error;
use crate::FileSystem;
use crate::NAME_MAX;

/// 解析路径。绝对路径从根出发，相对路径从调用者当前目录的重开句柄出发；
/// 空路径或单独的`/`解析到根目录本身，最终名为`.`。
pub(crate) fn parse(
    fs: &Arc<FileSystem>,
    cwd: &Directory,
    path: &str,
) -> Result<(Directory, String), Error> {
    let mut dir = if path.starts_with('/') || path.is_empty() {
        Directory::open_root(fs)
    } else {
        cwd.reopen()
    };

    let mut components = path.split('/').filter(|s| !s.is_empty());

    let Some(mut token) = components.next() else {
        return Ok((dir, String::from(".")));
    };

    for next in components {
        // 中间组件必须是已存在的目录；
        // 下一级打开之后才关上一级，避免与父目录的删除竞争
        let inode = dir.lookup(token).ok_or(Error::NotFound)?;
        dir = Directory::open(inode)?;
        token = next;
    }

    if token.len() > NAME_MAX {
        return Err(Error::NameTooLong);
    }

    Ok((dir, String::from(token)))
}
