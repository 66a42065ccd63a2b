mod daemon_commands;
